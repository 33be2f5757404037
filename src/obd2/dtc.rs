//! Diagnostic trouble code (DTC) representation and decoding.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
/// System category a trouble code belongs to, encoded in the top two bits
/// of the raw value
pub enum DtcCategory {
    /// Powertrain
    #[strum(serialize = "P")]
    Powertrain,
    /// Chassis
    #[strum(serialize = "C")]
    Chassis,
    /// Body
    #[strum(serialize = "B")]
    Body,
    /// Network / communication
    #[strum(serialize = "U")]
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// One diagnostic trouble code as reported by the vehicle
pub struct Dtc {
    /// Raw 16 bit value from the response payload
    pub raw: u16,
}

impl Dtc {
    /// Category letter selected by the top two bits
    pub fn category(&self) -> DtcCategory {
        match (self.raw >> 14) & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    /// The low 14 bits, rendered as the four hex digits of the code
    pub fn code(&self) -> u16 {
        self.raw & 0x3FFF
    }
}

impl std::fmt::Display for Dtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:04X}", self.category(), self.code())
    }
}

/// Decodes a mode 03 payload into trouble codes.
///
/// Entries are consecutive 2 byte big-endian values. A raw value of 0x0000
/// means "no code" and is never emitted. A trailing odd byte is ignored.
pub(crate) fn decode_dtc_payload(payload: &[u8]) -> Vec<Dtc> {
    payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .filter(|raw| *raw != 0)
        .map(|raw| Dtc { raw })
        .collect()
}
