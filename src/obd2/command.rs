//! OBD2 command and response definitions, including the static mode-01
//! PID table with conversion formulas.

use std::time::SystemTime;

use crate::obd2::dtc::Dtc;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// OBD2 diagnostic modes (SAE J1979 services)
pub enum Mode {
    /// Show current data
    CurrentData = 0x01,
    /// Show freeze frame data
    FreezeFrame = 0x02,
    /// Show stored diagnostic trouble codes
    StoredCodes = 0x03,
    /// Clear trouble codes and stored values
    ClearCodes = 0x04,
    /// Oxygen sensor monitoring test results
    OxygenSensor = 0x05,
    /// On-board monitoring test results
    MonitorResults = 0x06,
    /// Show pending trouble codes
    PendingCodes = 0x07,
    /// Control operation of an on-board system
    ControlOperation = 0x08,
    /// Request vehicle information
    VehicleInfo = 0x09,
    /// Show permanent trouble codes
    PermanentCodes = 0x0A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One OBD2 request definition
pub struct Command {
    /// Diagnostic mode of the request
    pub mode: Mode,
    /// Parameter ID. `None` for requests without a PID byte (mode 03/04)
    pub pid: Option<u8>,
    /// Human readable description of the request
    pub description: &'static str,
    /// Number of payload bytes a positive response carries
    pub bytes_expected: u8,
    /// Conversion formula over the payload bytes `A, B, C, ...`
    pub formula: Option<&'static str>,
}

impl Command {
    /// Mode-01 (current data) command definition
    pub const fn mode01(
        pid: u8,
        description: &'static str,
        bytes_expected: u8,
        formula: Option<&'static str>,
    ) -> Self {
        Self {
            mode: Mode::CurrentData,
            pid: Some(pid),
            description,
            bytes_expected,
            formula,
        }
    }

    /// Command with a mode byte only, no PID (mode 03/04 style)
    pub const fn bare(mode: Mode, description: &'static str) -> Self {
        Self {
            mode,
            pid: None,
            description,
            bytes_expected: 0,
            formula: None,
        }
    }

    /// ELM327 ASCII frame: `"01 0C\r"` for mode 01 PID 0x0C, `"03\r"` for a
    /// PID-less request
    pub fn elm_frame(&self) -> Vec<u8> {
        match self.pid {
            Some(pid) => format!("{:02X} {:02X}\r", self.mode as u8, pid).into_bytes(),
            None => format!("{:02X}\r", self.mode as u8).into_bytes(),
        }
    }

    /// Raw OBD2 frame: the mode byte followed by the PID byte if present
    pub fn raw_frame(&self) -> Vec<u8> {
        match self.pid {
            Some(pid) => vec![self.mode as u8, pid],
            None => vec![self.mode as u8],
        }
    }
}

/// Mode-01 monitor status command, used as the liveness probe after bring-up
pub const MONITOR_STATUS: Command =
    Command::mode01(0x01, "Monitor status since DTCs cleared", 4, None);

/// Common mode-01 (current data) PID definitions
pub const MODE01_PIDS: &[Command] = &[
    Command::mode01(0x00, "PIDs supported [01-20]", 4, None),
    MONITOR_STATUS,
    Command::mode01(0x02, "Freeze DTC", 2, None),
    Command::mode01(0x03, "Fuel system status", 2, None),
    Command::mode01(0x04, "Calculated engine load", 1, Some("A*100/255")),
    Command::mode01(0x05, "Engine coolant temperature", 1, Some("A-40")),
    Command::mode01(0x06, "Short term fuel trim - Bank 1", 1, Some("(A-128)*100/128")),
    Command::mode01(0x07, "Long term fuel trim - Bank 1", 1, Some("(A-128)*100/128")),
    Command::mode01(0x08, "Short term fuel trim - Bank 2", 1, Some("(A-128)*100/128")),
    Command::mode01(0x09, "Long term fuel trim - Bank 2", 1, Some("(A-128)*100/128")),
    Command::mode01(0x0A, "Fuel pressure", 1, Some("A*3")),
    Command::mode01(0x0B, "Intake manifold absolute pressure", 1, Some("A")),
    Command::mode01(0x0C, "Engine RPM", 2, Some("((A*256)+B)/4")),
    Command::mode01(0x0D, "Vehicle speed", 1, Some("A")),
    Command::mode01(0x0E, "Timing advance", 1, Some("(A-128)/2")),
    Command::mode01(0x0F, "Intake air temperature", 1, Some("A-40")),
    Command::mode01(0x10, "MAF air flow rate", 2, Some("((A*256)+B)/100")),
    Command::mode01(0x11, "Throttle position", 1, Some("A*100/255")),
];

/// Looks up the mode-01 command definition for `pid`
pub fn mode01_command(pid: u8) -> Option<&'static Command> {
    MODE01_PIDS.iter().find(|c| c.pid == Some(pid))
}

#[derive(Debug, Clone, PartialEq)]
/// Decoded value carried by a [Response]
pub enum DecodedValue {
    /// No payload was present
    None,
    /// Formula-converted numeric value
    Number(f64),
    /// Raw payload bytes (no conversion formula defined)
    Bytes(Vec<u8>),
    /// Decoded diagnostic trouble codes
    TroubleCodes(Vec<Dtc>),
}

#[derive(Debug, Clone)]
/// Result of one [Command] execution.
///
/// Failures are captured in [Response::success] and
/// [Response::error_message] rather than propagated, so call sites inspect
/// the result instead of handling errors.
pub struct Response {
    /// The command that produced this response
    pub command: Command,
    /// Raw reply bytes as received from the transport
    pub raw: Vec<u8>,
    /// Decoded value
    pub value: DecodedValue,
    /// When the response was captured
    pub timestamp: SystemTime,
    /// Whether the exchange succeeded
    pub success: bool,
    /// Failure description when `success` is false
    pub error_message: Option<String>,
}

impl Response {
    pub(crate) fn ok(command: Command, raw: Vec<u8>, value: DecodedValue) -> Self {
        Self {
            command,
            raw,
            value,
            timestamp: SystemTime::now(),
            success: true,
            error_message: None,
        }
    }

    pub(crate) fn failed(command: Command, raw: Vec<u8>, error: String) -> Self {
        Self {
            command,
            raw,
            value: DecodedValue::None,
            timestamp: SystemTime::now(),
            success: false,
            error_message: Some(error),
        }
    }
}
