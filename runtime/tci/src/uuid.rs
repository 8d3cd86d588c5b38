//! Destination identity of a trusted application

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// UUID parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UuidParseError {
    #[error("UUID must be 36 characters, got {len}")]
    InvalidLength { len: usize },

    #[error("Expected '-' at position {position}")]
    MissingSeparator { position: usize },

    #[error("Invalid hex digit at position {position}")]
    InvalidDigit { position: usize },
}

/// Trusted application identity in GlobalPlatform layout
///
/// Written verbatim into [`crate::Tci::destination`], so the field order and
/// widths are part of the wire format.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_and_node: [u8; 8],
}

/// Offsets of the dashes in the canonical 8-4-4-4-12 form
const SEPARATORS: [usize; 4] = [8, 13, 18, 23];

impl Uuid {
    pub const fn new(
        time_low: u32,
        time_mid: u16,
        time_hi_and_version: u16,
        clock_seq_and_node: [u8; 8],
    ) -> Self {
        Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_and_node,
        }
    }

    /// Build a UUID from its 16 big-endian bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut node = [0u8; 8];
        node.copy_from_slice(&bytes[8..]);
        Self {
            time_low: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            time_mid: u16::from_be_bytes([bytes[4], bytes[5]]),
            time_hi_and_version: u16::from_be_bytes([bytes[6], bytes[7]]),
            clock_seq_and_node: node,
        }
    }

    /// The 16 big-endian bytes of this UUID
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.time_low.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.time_mid.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.time_hi_and_version.to_be_bytes());
        bytes[8..].copy_from_slice(&self.clock_seq_and_node);
        bytes
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.as_bytes();
        if raw.len() != 36 {
            return Err(UuidParseError::InvalidLength { len: raw.len() });
        }

        let mut bytes = [0u8; 16];
        let mut nibbles = 0usize;
        for (position, &c) in raw.iter().enumerate() {
            if SEPARATORS.contains(&position) {
                if c != b'-' {
                    return Err(UuidParseError::MissingSeparator { position });
                }
                continue;
            }
            let digit = (c as char)
                .to_digit(16)
                .ok_or(UuidParseError::InvalidDigit { position })? as u8;
            bytes[nibbles / 2] |= if nibbles % 2 == 0 { digit << 4 } else { digit };
            nibbles += 1;
        }

        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = &self.clock_seq_and_node;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            n[0],
            n[1],
            n[2],
            n[3],
            n[4],
            n[5],
            n[6],
            n[7]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let text = "808032e0-fd9e-4e6f-8896-544735c98480";
        let uuid: Uuid = text.parse().unwrap();

        assert_eq!(uuid.time_low, 0x808032e0);
        assert_eq!(uuid.time_mid, 0xfd9e);
        assert_eq!(uuid.time_hi_and_version, 0x4e6f);
        assert_eq!(
            uuid.clock_seq_and_node,
            [0x88, 0x96, 0x54, 0x47, 0x35, 0xc9, 0x84, 0x80]
        );
        assert_eq!(uuid.to_string(), text);
    }

    #[test]
    fn test_parse_uppercase() {
        let uuid: Uuid = "808032E0-FD9E-4E6F-8896-544735C98480".parse().unwrap();
        assert_eq!(uuid.time_low, 0x808032e0);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "1234".parse::<Uuid>(),
            Err(UuidParseError::InvalidLength { len: 4 })
        );
        assert_eq!(
            "808032e0xfd9e-4e6f-8896-544735c98480".parse::<Uuid>(),
            Err(UuidParseError::MissingSeparator { position: 8 })
        );
        assert_eq!(
            "808032g0-fd9e-4e6f-8896-544735c98480".parse::<Uuid>(),
            Err(UuidParseError::InvalidDigit { position: 6 })
        );
    }

    #[test]
    fn test_bytes_round_trip() {
        let bytes = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        assert_eq!(Uuid::from_bytes(bytes).to_bytes(), bytes);
    }
}
