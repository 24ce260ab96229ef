//! Error handling for the ATT protocol
use super::constants::*;
use thiserror::Error;

/// ATT error codes carried in an Error Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttErrorCode {
    /// Invalid handle
    InvalidHandle,
    /// Read not permitted
    ReadNotPermitted,
    /// Write not permitted
    WriteNotPermitted,
    /// Invalid PDU
    InvalidPdu,
    /// Insufficient authentication
    InsufficientAuthentication,
    /// Request not supported
    RequestNotSupported,
    /// Invalid offset
    InvalidOffset,
    /// Insufficient authorization
    InsufficientAuthorization,
    /// Prepare queue full
    PrepareQueueFull,
    /// Attribute not found
    AttributeNotFound,
    /// Attribute not long
    AttributeNotLong,
    /// Invalid attribute value length
    InvalidAttributeValueLength,
    /// Unlikely error
    Unlikely,
    /// Insufficient encryption
    InsufficientEncryption,
    /// Unsupported group type
    UnsupportedGroupType,
    /// Insufficient resources
    InsufficientResources,
    /// Application error (0x80..=0x9F)
    ApplicationError(u8),
    /// Any other code
    Unknown(u8),
}

impl From<u8> for AttErrorCode {
    fn from(code: u8) -> Self {
        match code {
            ATT_ERROR_INVALID_HANDLE => AttErrorCode::InvalidHandle,
            ATT_ERROR_READ_NOT_PERMITTED => AttErrorCode::ReadNotPermitted,
            ATT_ERROR_WRITE_NOT_PERMITTED => AttErrorCode::WriteNotPermitted,
            ATT_ERROR_INVALID_PDU => AttErrorCode::InvalidPdu,
            ATT_ERROR_INSUFFICIENT_AUTHENTICATION => AttErrorCode::InsufficientAuthentication,
            ATT_ERROR_REQUEST_NOT_SUPPORTED => AttErrorCode::RequestNotSupported,
            ATT_ERROR_INVALID_OFFSET => AttErrorCode::InvalidOffset,
            ATT_ERROR_INSUFFICIENT_AUTHORIZATION => AttErrorCode::InsufficientAuthorization,
            ATT_ERROR_PREPARE_QUEUE_FULL => AttErrorCode::PrepareQueueFull,
            ATT_ERROR_ATTRIBUTE_NOT_FOUND => AttErrorCode::AttributeNotFound,
            ATT_ERROR_ATTRIBUTE_NOT_LONG => AttErrorCode::AttributeNotLong,
            ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH => AttErrorCode::InvalidAttributeValueLength,
            ATT_ERROR_UNLIKELY => AttErrorCode::Unlikely,
            ATT_ERROR_INSUFFICIENT_ENCRYPTION => AttErrorCode::InsufficientEncryption,
            ATT_ERROR_UNSUPPORTED_GROUP_TYPE => AttErrorCode::UnsupportedGroupType,
            ATT_ERROR_INSUFFICIENT_RESOURCES => AttErrorCode::InsufficientResources,
            c if (ATT_ERROR_APPLICATION_ERROR_START..=ATT_ERROR_APPLICATION_ERROR_END)
                .contains(&c) =>
            {
                AttErrorCode::ApplicationError(c)
            }
            _ => AttErrorCode::Unknown(code),
        }
    }
}

impl From<AttErrorCode> for u8 {
    fn from(code: AttErrorCode) -> u8 {
        match code {
            AttErrorCode::InvalidHandle => ATT_ERROR_INVALID_HANDLE,
            AttErrorCode::ReadNotPermitted => ATT_ERROR_READ_NOT_PERMITTED,
            AttErrorCode::WriteNotPermitted => ATT_ERROR_WRITE_NOT_PERMITTED,
            AttErrorCode::InvalidPdu => ATT_ERROR_INVALID_PDU,
            AttErrorCode::InsufficientAuthentication => ATT_ERROR_INSUFFICIENT_AUTHENTICATION,
            AttErrorCode::RequestNotSupported => ATT_ERROR_REQUEST_NOT_SUPPORTED,
            AttErrorCode::InvalidOffset => ATT_ERROR_INVALID_OFFSET,
            AttErrorCode::InsufficientAuthorization => ATT_ERROR_INSUFFICIENT_AUTHORIZATION,
            AttErrorCode::PrepareQueueFull => ATT_ERROR_PREPARE_QUEUE_FULL,
            AttErrorCode::AttributeNotFound => ATT_ERROR_ATTRIBUTE_NOT_FOUND,
            AttErrorCode::AttributeNotLong => ATT_ERROR_ATTRIBUTE_NOT_LONG,
            AttErrorCode::InvalidAttributeValueLength => ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH,
            AttErrorCode::Unlikely => ATT_ERROR_UNLIKELY,
            AttErrorCode::InsufficientEncryption => ATT_ERROR_INSUFFICIENT_ENCRYPTION,
            AttErrorCode::UnsupportedGroupType => ATT_ERROR_UNSUPPORTED_GROUP_TYPE,
            AttErrorCode::InsufficientResources => ATT_ERROR_INSUFFICIENT_RESOURCES,
            AttErrorCode::ApplicationError(code) => code,
            AttErrorCode::Unknown(code) => code,
        }
    }
}

/// Errors raised while decoding or encoding ATT PDUs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttError {
    #[error("Empty PDU")]
    EmptyPdu,

    #[error("Truncated PDU for opcode {opcode:#04x}: need {needed} bytes, got {actual}")]
    InvalidPdu {
        opcode: u8,
        needed: usize,
        actual: usize,
    },

    #[error("Unsupported opcode {0:#04x}")]
    UnsupportedOpcode(u8),

    #[error("Unexpected opcode {actual:#04x}, expected {expected:#04x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },

    #[error("Invalid UUID length: {0}")]
    InvalidUuidLength(usize),

    #[error("Invalid execute write flag: {0:#04x}")]
    InvalidExecuteFlag(u8),

    #[error("PDU of {len} bytes exceeds MTU {mtu}")]
    PduTooLong { len: usize, mtu: u16 },

    #[error("Payload of {len} bytes exceeds {max} bytes available under MTU {mtu}")]
    PayloadTooLarge { len: usize, max: usize, mtu: u16 },
}

impl AttError {
    pub(crate) fn truncated(opcode: u8, needed: usize, actual: usize) -> Self {
        AttError::InvalidPdu {
            opcode,
            needed,
            actual,
        }
    }

    /// Convert to the ATT error code reported to the peer
    pub fn to_error_code(&self) -> AttErrorCode {
        match self {
            AttError::UnsupportedOpcode(_) => AttErrorCode::RequestNotSupported,
            AttError::PayloadTooLarge { .. } => AttErrorCode::Unlikely,
            _ => AttErrorCode::InvalidPdu,
        }
    }
}

/// ATT Result type
pub type AttResult<T> = Result<T, AttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        for raw in [0x01u8, 0x02, 0x03, 0x07, 0x0A, 0x0D, 0x0F, 0x85] {
            let code = AttErrorCode::from(raw);
            assert_eq!(u8::from(code), raw);
        }
        assert_eq!(AttErrorCode::from(0x80), AttErrorCode::ApplicationError(0x80));
        assert_eq!(AttErrorCode::from(0x42), AttErrorCode::Unknown(0x42));
    }

    #[test]
    fn test_oversized_pdu_reports_invalid_pdu() {
        let err = AttError::PduTooLong { len: 600, mtu: 23 };
        assert_eq!(err.to_error_code(), AttErrorCode::InvalidPdu);
        assert_eq!(err.to_string(), "PDU of 600 bytes exceeds MTU 23");
    }
}
