use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Represents a 128-bit Bluetooth UUID.
///
/// Stored as 128 bits in little-endian byte order, which is the order ATT puts
/// on the wire. SIG-assigned 16-bit and 32-bit values are expanded against the
/// Bluetooth base UUID and can be recovered with [`Uuid::as_u16`].
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    bytes: [u8; 16],
}

/// "00000000-0000-1000-8000-00805F9B34FB" in little-endian order.
const BASE_UUID_BYTES: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Offset within the base UUID where the 16/32-bit value is inserted.
const BASE_OFFSET: usize = 12;

impl Uuid {
    /// Creates a UUID directly from 16 little-endian bytes.
    pub const fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    /// Creates a UUID from 16 big-endian bytes (the order of the textual form).
    pub fn from_bytes_be(mut bytes: [u8; 16]) -> Self {
        bytes.reverse();
        Uuid { bytes }
    }

    /// Creates a UUID from a 16-bit SIG-assigned value.
    pub const fn from_u16(uuid16: u16) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid16 as u8;
        bytes[BASE_OFFSET + 1] = (uuid16 >> 8) as u8;
        Uuid { bytes }
    }

    /// Creates a UUID from a 32-bit SIG-assigned value.
    pub const fn from_u32(uuid32: u32) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid32 as u8;
        bytes[BASE_OFFSET + 1] = (uuid32 >> 8) as u8;
        bytes[BASE_OFFSET + 2] = (uuid32 >> 16) as u8;
        bytes[BASE_OFFSET + 3] = (uuid32 >> 24) as u8;
        Uuid { bytes }
    }

    /// Creates a UUID from its 128-bit numeric value.
    pub const fn from_u128(value: u128) -> Self {
        Uuid {
            bytes: value.to_le_bytes(),
        }
    }

    /// Decodes a UUID as it appears in an ATT PDU: 2 or 16 little-endian bytes.
    pub fn from_att_bytes(slice: &[u8]) -> Option<Self> {
        match slice.len() {
            2 => Some(Uuid::from_u16(u16::from_le_bytes([slice[0], slice[1]]))),
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(slice);
                Some(Uuid::from_bytes_le(bytes))
            }
            _ => None,
        }
    }

    /// Encodes the UUID in its shortest ATT form: 2 bytes when it is a 16-bit
    /// SIG-assigned value, 16 bytes otherwise. 32-bit UUIDs are never sent as
    /// 4 bytes over ATT.
    pub fn to_att_bytes(&self) -> Vec<u8> {
        match self.as_u16() {
            Some(short) => short.to_le_bytes().to_vec(),
            None => self.bytes.to_vec(),
        }
    }

    /// Generates a random (version 4) UUID.
    pub fn new_random_v4() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Version and variant live in big-endian octets 6 and 8.
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Uuid::from_bytes_be(bytes)
    }

    /// Returns the underlying 16 bytes in little-endian order.
    pub const fn as_bytes_le(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Returns the underlying 16 bytes in big-endian order.
    pub fn as_bytes_be(&self) -> [u8; 16] {
        let mut bytes = self.bytes;
        bytes.reverse();
        bytes
    }

    fn is_sig_assigned(&self) -> bool {
        self.bytes[0..BASE_OFFSET] == BASE_UUID_BYTES[0..BASE_OFFSET]
    }

    /// Returns the 16-bit value if this is a SIG-assigned 16-bit UUID.
    pub fn as_u16(&self) -> Option<u16> {
        if self.is_sig_assigned()
            && self.bytes[BASE_OFFSET + 2] == 0
            && self.bytes[BASE_OFFSET + 3] == 0
        {
            Some(u16::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
            ]))
        } else {
            None
        }
    }

    /// Returns the 32-bit value if this UUID is derived from the base UUID.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some(u32::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
                self.bytes[BASE_OFFSET + 2],
                self.bytes[BASE_OFFSET + 3],
            ]))
        } else {
            None
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u32> for Uuid {
    fn from(uuid32: u32) -> Self {
        Uuid::from_u32(uuid32)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.as_bytes_be();
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.as_u16(), self.as_u32()) {
            (Some(short), _) => write!(f, "Uuid(0x{:04X})", short),
            (None, Some(long)) => write!(f, "Uuid(0x{:08X})", long),
            _ => write!(f, "Uuid({})", self),
        }
    }
}

/// Errors parsing a textual UUID
#[derive(Debug, Error)]
pub enum UuidParseError {
    #[error("UUID must have 4, 8 or 32 hex digits, got {0}")]
    InvalidLength(usize),

    #[error("Invalid hex in UUID: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts "180A", "0000180A" or the full hyphenated 128-bit form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();

        match cleaned.len() {
            4 => {
                let mut raw = [0u8; 2];
                hex::decode_to_slice(&cleaned, &mut raw)?;
                Ok(Uuid::from_u16(u16::from_be_bytes(raw)))
            }
            8 => {
                let mut raw = [0u8; 4];
                hex::decode_to_slice(&cleaned, &mut raw)?;
                Ok(Uuid::from_u32(u32::from_be_bytes(raw)))
            }
            32 => {
                let mut bytes_be = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes_be)?;
                Ok(Uuid::from_bytes_be(bytes_be))
            }
            len => Err(UuidParseError::InvalidLength(len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expands_against_base() {
        let uuid = Uuid::from_u16(0x2222);
        assert_eq!(uuid.to_string(), "00002222-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid.as_u16(), Some(0x2222));
        assert_eq!(uuid.to_att_bytes(), vec![0x22, 0x22]);
    }

    #[test]
    fn test_parse_full_form_recovers_short_value() {
        let uuid: Uuid = "00001111-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(uuid, Uuid::from_u16(0x1111));

        let short: Uuid = "2A00".parse().unwrap();
        assert_eq!(short.as_u16(), Some(0x2A00));

        assert!(matches!(
            "12345".parse::<Uuid>(),
            Err(UuidParseError::InvalidLength(5))
        ));
    }

    #[test]
    fn test_random_uuid_is_128_bit() {
        let uuid = Uuid::new_random_v4();
        assert_eq!(uuid.as_bytes_be()[6] >> 4, 4);
        assert_eq!(uuid.to_att_bytes().len(), 16);
        assert_eq!(Uuid::from_att_bytes(&uuid.to_att_bytes()), Some(uuid));
    }
}
