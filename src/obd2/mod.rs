//! OBD2 protocol engine (SAE J1979 over an ELM327-style adapter).
//!
//! [Obd2Engine] drives one connection owned by a
//! [crate::connection::ConnectionManager]: it runs the ELM327 bring-up
//! sequence, formats and sends [Command]s, validates the mode/PID echo in
//! every reply, converts payloads through the per-PID formulas, discovers
//! which PIDs the vehicle supports and decodes stored trouble codes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionManager;

mod command;
mod dtc;
mod formula;

// Exports
pub use command::*;
pub use dtc::*;
pub use formula::{FormulaError, evaluate};

/// ELM327 bring-up sequence: reset, echo off, linefeeds off, spaces off,
/// headers on, auto protocol
const ELM_INIT_SEQUENCE: &[&[u8]] = &[b"ATZ\r", b"ATE0\r", b"ATL0\r", b"ATS0\r", b"ATH1\r", b"ATSP0\r"];

/// Pause between bring-up commands. ELM clones need a moment to settle.
const INIT_COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Per-command timeout during bring-up
const INIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for a command exchange
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Base PIDs whose 32 bit bitmaps cover the whole mode-01 PID space
const PID_SUPPORT_BASES: &[u8] = &[0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The transport delivered a reply, but it violates the OBD2 response contract
pub enum ProtocolError {
    /// The adapter reported a protocol-level failure (`NO DATA`, `ERROR`)
    #[error("adapter error: {0}")]
    AdapterError(String),
    /// Fewer tokens than the echoed mode/PID require
    #[error("response too short: {0:?}")]
    ResponseTooShort(String),
    /// A token was not a hex byte pair
    #[error("invalid hex token {0:?} in response")]
    InvalidHexToken(String),
    /// Echoed mode did not match the request
    #[error("mode mismatch: expected {expected:02X}, got {observed:02X}")]
    ModeMismatch {
        /// Mode the request implies (`mode + 0x40`)
        expected: u8,
        /// Mode the reply carried
        observed: u8,
    },
    /// Echoed PID did not match the request
    #[error("PID mismatch: expected {expected:02X}, got {observed:02X}")]
    PidMismatch {
        /// Requested PID
        expected: u8,
        /// PID the reply carried
        observed: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Wire format used to frame commands
pub enum WireMode {
    /// ELM327 ASCII framing (`"01 0C\r"`)
    #[default]
    Elm327,
    /// Raw mode/PID bytes
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle state of an [Obd2Engine].
///
/// `Faulted` is terminal: a new engine instance must be constructed to retry.
pub enum EngineState {
    /// Constructed, [Obd2Engine::initialize] not yet run
    Uninitialized,
    /// Bring-up sequence in progress
    Initializing,
    /// Liveness probe succeeded, engine is usable
    Ready,
    /// Liveness probe failed
    Faulted,
}

#[derive(Debug, Clone, Default)]
/// Per-base bitmap of vehicle supported PIDs, populated during
/// [Obd2Engine::initialize]
pub struct SupportedPidMap {
    by_base: HashMap<u8, Vec<u8>>,
}

impl SupportedPidMap {
    /// Supported absolute PIDs recorded under `base`, empty if that base was
    /// never successfully queried
    pub fn supported_for(&self, base: u8) -> &[u8] {
        self.by_base.get(&base).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `pid` was reported as supported
    pub fn is_supported(&self, pid: u8) -> bool {
        let base = (pid / 32) * 32;
        self.supported_for(base).contains(&pid)
    }

    /// True if no base has been populated
    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    fn record(&mut self, base: u8, pids: Vec<u8>) {
        self.by_base.insert(base, pids);
    }
}

/// Decodes a 4 byte big-endian support bitmap, most significant bit first.
/// Bit `i` set means absolute PID `base + i + 1` is supported.
pub(crate) fn decode_support_bitmap(payload: &[u8], base: u8) -> Vec<u8> {
    let mut supported = Vec::new();
    if payload.len() >= 4 {
        let bitmap = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        for i in 0..32u8 {
            if bitmap & (1 << (31 - i)) != 0 {
                supported.push(base + i + 1);
            }
        }
    }
    supported
}

/// OBD2 protocol state machine over one managed connection
#[derive(Debug)]
pub struct Obd2Engine {
    manager: Arc<ConnectionManager>,
    connection_id: String,
    wire_mode: WireMode,
    state: EngineState,
    supported_pids: SupportedPidMap,
}

impl Obd2Engine {
    /// Creates an engine over `connection_id` in ELM327 wire mode
    pub fn new(manager: Arc<ConnectionManager>, connection_id: impl Into<String>) -> Self {
        Self {
            manager,
            connection_id: connection_id.into(),
            wire_mode: WireMode::default(),
            state: EngineState::Uninitialized,
            supported_pids: SupportedPidMap::default(),
        }
    }

    /// Creates an engine with an explicit wire mode
    pub fn with_wire_mode(
        manager: Arc<ConnectionManager>,
        connection_id: impl Into<String>,
        wire_mode: WireMode,
    ) -> Self {
        let mut engine = Self::new(manager, connection_id);
        engine.wire_mode = wire_mode;
        engine
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The connection this engine drives
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Supported PID map discovered during [Obd2Engine::initialize]
    pub fn supported_pids(&self) -> &SupportedPidMap {
        &self.supported_pids
    }

    /// Supported absolute PIDs recorded under `base`
    pub fn supported_pids_for(&self, base: u8) -> &[u8] {
        self.supported_pids.supported_for(base)
    }

    /// Whether the vehicle reported `pid` as supported
    pub fn is_pid_supported(&self, pid: u8) -> bool {
        self.supported_pids.is_supported(pid)
    }

    /// Brings the adapter up and probes the vehicle.
    ///
    /// Runs the ELM327 bring-up sequence (each command best-effort, logged on
    /// failure since clones vary in which commands they accept), then sends
    /// the mode-01 monitor status command as a liveness probe. On a
    /// successful probe the engine becomes [EngineState::Ready] and
    /// supported-PID discovery runs best-effort; otherwise the engine is
    /// [EngineState::Faulted] and false is returned.
    pub fn initialize(&mut self) -> bool {
        if self.state != EngineState::Uninitialized {
            log::warn!(
                "initialize called on {} in state {:?}",
                self.connection_id,
                self.state
            );
            return self.state == EngineState::Ready;
        }
        self.state = EngineState::Initializing;
        log::info!("initializing OBD2 protocol on {}", self.connection_id);

        if self.wire_mode == WireMode::Elm327 {
            self.run_elm_bringup();
        }

        let probe = self.send_command(&MONITOR_STATUS, DEFAULT_COMMAND_TIMEOUT);
        if probe.success {
            self.state = EngineState::Ready;
            log::info!("OBD2 protocol initialized on {}", self.connection_id);
            self.discover_supported_pids();
            true
        } else {
            self.state = EngineState::Faulted;
            log::error!(
                "OBD2 liveness probe failed on {}: {}",
                self.connection_id,
                probe.error_message.as_deref().unwrap_or("unknown")
            );
            false
        }
    }

    fn run_elm_bringup(&self) {
        for cmd in ELM_INIT_SEQUENCE {
            std::thread::sleep(INIT_COMMAND_DELAY);
            if let Err(e) = self
                .manager
                .send_data(&self.connection_id, cmd, INIT_COMMAND_TIMEOUT)
            {
                log::warn!("ELM327 setup command {cmd:02X?} failed: {e}");
            }
        }
    }

    /// Sends `command` and returns its [Response].
    ///
    /// Never propagates an error: timeouts, transport failures and protocol
    /// violations all come back as `success == false` with an error message.
    pub fn send_command(&self, command: &Command, timeout: Duration) -> Response {
        let frame = match self.wire_mode {
            WireMode::Elm327 => command.elm_frame(),
            WireMode::Raw => command.raw_frame(),
        };
        let raw = match self.manager.send_data(&self.connection_id, &frame, timeout) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("command '{}' failed: {e}", command.description);
                return Response::failed(*command, Vec::new(), e.to_string());
            }
        };
        match self.parse_payload(command, &raw) {
            Ok(payload) => {
                let value = decode_payload(command, payload);
                Response::ok(*command, raw, value)
            }
            Err(e) => {
                log::error!("command '{}' failed: {e}", command.description);
                Response::failed(*command, raw, e.to_string())
            }
        }
    }

    fn parse_payload(&self, command: &Command, raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self.wire_mode {
            WireMode::Elm327 => parse_elm_payload(command, raw),
            WireMode::Raw => parse_raw_payload(raw),
        }
    }

    /// Queries the support bitmap for every base PID with a table definition.
    /// Best-effort: failures are logged and discovery moves on.
    fn discover_supported_pids(&mut self) {
        for base in PID_SUPPORT_BASES {
            let Some(cmd) = mode01_command(*base) else {
                continue;
            };
            let response = self.send_command(cmd, DEFAULT_COMMAND_TIMEOUT);
            if !response.success {
                log::warn!(
                    "PID support query for base {base:02X} failed: {}",
                    response.error_message.as_deref().unwrap_or("unknown")
                );
                continue;
            }
            if let DecodedValue::Bytes(payload) = &response.value {
                let supported = decode_support_bitmap(payload, *base);
                log::debug!("base {base:02X} supports PIDs {supported:02X?}");
                self.supported_pids.record(*base, supported);
            }
        }
    }

    /// Reads the stored diagnostic trouble codes (mode 03).
    ///
    /// Degrades to an empty list on any failure.
    pub fn read_dtc_codes(&self) -> Vec<Dtc> {
        let cmd = Command::bare(Mode::StoredCodes, "Stored DTCs");
        let response = self.send_command(&cmd, DEFAULT_COMMAND_TIMEOUT);
        if !response.success {
            log::error!(
                "DTC read failed: {}",
                response.error_message.as_deref().unwrap_or("unknown")
            );
            return Vec::new();
        }
        match response.value {
            DecodedValue::TroubleCodes(codes) => codes,
            _ => Vec::new(),
        }
    }

    /// Clears stored trouble codes and the MIL (mode 04). Returns whether
    /// the vehicle acknowledged the request.
    pub fn clear_dtc_codes(&self) -> bool {
        let cmd = Command::bare(Mode::ClearCodes, "Clear DTCs");
        let response = self.send_command(&cmd, DEFAULT_COMMAND_TIMEOUT);
        if !response.success {
            log::error!(
                "DTC clear failed: {}",
                response.error_message.as_deref().unwrap_or("unknown")
            );
        }
        response.success
    }
}

/// Applies the command's conversion formula to the payload. A formula that
/// fails to evaluate logs and falls back to the first payload byte.
fn decode_payload(command: &Command, payload: Vec<u8>) -> DecodedValue {
    if command.mode == Mode::StoredCodes || command.mode == Mode::PendingCodes {
        return DecodedValue::TroubleCodes(decode_dtc_payload(&payload));
    }
    match command.formula {
        Some(formula) if !payload.is_empty() => match evaluate(formula, &payload) {
            Ok(value) => DecodedValue::Number(value),
            Err(e) => {
                log::error!("formula {formula:?} failed over {payload:02X?}: {e}");
                DecodedValue::Number(f64::from(payload[0]))
            }
        },
        _ => DecodedValue::Bytes(payload),
    }
}

/// Parses an ELM327 ASCII reply into the payload bytes, validating the
/// echoed mode (`mode + 0x40`) and PID against the request.
fn parse_elm_payload(command: &Command, raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let text = String::from_utf8_lossy(raw);
    let cleaned = text.replace(['>', '\r', '\n'], " ");
    let cleaned = cleaned.trim();

    if cleaned.contains("NO DATA") || cleaned.contains("ERROR") {
        return Err(ProtocolError::AdapterError(cleaned.to_string()));
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    // Echoed mode, plus the echoed PID when the request carried one
    let echo_len = if command.pid.is_some() { 2 } else { 1 };
    if tokens.len() < echo_len {
        return Err(ProtocolError::ResponseTooShort(cleaned.to_string()));
    }

    let bytes = tokens
        .iter()
        .map(|t| {
            u8::from_str_radix(t, 16).map_err(|_| ProtocolError::InvalidHexToken(t.to_string()))
        })
        .collect::<Result<Vec<u8>, ProtocolError>>()?;

    let expected_mode = command.mode as u8 + 0x40;
    if bytes[0] != expected_mode {
        return Err(ProtocolError::ModeMismatch {
            expected: expected_mode,
            observed: bytes[0],
        });
    }
    if let Some(pid) = command.pid {
        if bytes[1] != pid {
            return Err(ProtocolError::PidMismatch {
                expected: pid,
                observed: bytes[1],
            });
        }
    }
    Ok(bytes[echo_len..].to_vec())
}

/// Raw wire mode: payload is everything after the fixed 2 byte echo
fn parse_raw_payload(raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if raw.len() < 2 {
        return Err(ProtocolError::ResponseTooShort(format!("{raw:02X?}")));
    }
    Ok(raw[2..].to_vec())
}

#[cfg(test)]
mod parse_test {
    use super::*;

    fn rpm() -> &'static Command {
        mode01_command(0x0C).unwrap()
    }

    #[test]
    fn valid_elm_response_yields_payload() {
        let payload = parse_elm_payload(rpm(), b"41 0C 1A 2B>").unwrap();
        assert_eq!(payload, vec![0x1A, 0x2B]);
    }

    #[test]
    fn prompt_and_line_noise_are_stripped() {
        let payload = parse_elm_payload(rpm(), b"\r\n41 0C 1A 2B\r\r>").unwrap();
        assert_eq!(payload, vec![0x1A, 0x2B]);
    }

    #[test]
    fn no_data_marker_is_an_adapter_error() {
        let res = parse_elm_payload(rpm(), b"NO DATA>");
        assert!(matches!(res, Err(ProtocolError::AdapterError(_))));
    }

    #[test]
    fn error_marker_is_an_adapter_error() {
        let res = parse_elm_payload(rpm(), b"BUS ERROR>");
        assert!(matches!(res, Err(ProtocolError::AdapterError(_))));
    }

    #[test]
    fn mode_mismatch_names_both_values() {
        let res = parse_elm_payload(rpm(), b"42 0C 1A 2B>");
        assert_eq!(
            res,
            Err(ProtocolError::ModeMismatch {
                expected: 0x41,
                observed: 0x42
            })
        );
        let msg = res.unwrap_err().to_string();
        assert!(msg.contains("41") && msg.contains("42"));
    }

    #[test]
    fn pid_mismatch_names_both_values() {
        let res = parse_elm_payload(rpm(), b"41 0D 1A 2B>");
        assert_eq!(
            res,
            Err(ProtocolError::PidMismatch {
                expected: 0x0C,
                observed: 0x0D
            })
        );
    }

    #[test]
    fn short_response_is_rejected() {
        let res = parse_elm_payload(rpm(), b"41>");
        assert!(matches!(res, Err(ProtocolError::ResponseTooShort(_))));
    }

    #[test]
    fn non_hex_token_is_rejected() {
        let res = parse_elm_payload(rpm(), b"41 0C ZZ>");
        assert!(matches!(res, Err(ProtocolError::InvalidHexToken(_))));
    }

    #[test]
    fn pidless_command_skips_pid_echo() {
        let stored = Command::bare(Mode::StoredCodes, "Stored DTCs");
        let payload = parse_elm_payload(&stored, b"43 01 03 01 04>").unwrap();
        assert_eq!(payload, vec![0x01, 0x03, 0x01, 0x04]);
    }

    #[test]
    fn pidless_command_accepts_empty_payload() {
        let clear = Command::bare(Mode::ClearCodes, "Clear DTCs");
        let payload = parse_elm_payload(&clear, b"44>").unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn raw_mode_payload_follows_two_byte_echo() {
        assert_eq!(
            parse_raw_payload(&[0x41, 0x0C, 0x1A, 0x2B]).unwrap(),
            vec![0x1A, 0x2B]
        );
        assert!(matches!(
            parse_raw_payload(&[0x41]),
            Err(ProtocolError::ResponseTooShort(_))
        ));
    }
}

#[cfg(test)]
mod support_bitmap_test {
    use super::*;

    #[test]
    fn bitmap_pids_fall_in_range() {
        let supported = decode_support_bitmap(&[0xBE, 0x1F, 0xB8, 0x10], 0x00);
        assert!(!supported.is_empty());
        assert!(supported.iter().all(|p| *p > 0 && *p <= 32));
        // 0xBE = 0b10111110: bit 0 set means PID 0x01 supported
        assert!(supported.contains(&0x01));
        assert!(supported.contains(&0x0C));
        assert!(!supported.contains(&0x02));
    }

    #[test]
    fn bitmap_offsets_by_base() {
        let supported = decode_support_bitmap(&[0x80, 0x00, 0x00, 0x01], 0x20);
        assert_eq!(supported, vec![0x21, 0x40]);
    }

    #[test]
    fn short_payload_yields_empty_list() {
        assert!(decode_support_bitmap(&[0xFF, 0xFF], 0x00).is_empty());
    }

    #[test]
    fn support_map_membership() {
        let mut map = SupportedPidMap::default();
        map.record(0x00, decode_support_bitmap(&[0xBE, 0x1F, 0xB8, 0x10], 0x00));
        assert!(map.is_supported(0x0C));
        assert!(!map.is_supported(0x02));
        assert!(!map.is_supported(0x21));
        assert!(!map.is_empty());
    }
}
