//! Error types for the rustygatt library
//!
//! [`GattError`] is the engine-wide taxonomy. Protocol-level decode errors
//! live in [`crate::att::AttError`] and are wrapped here.

use crate::att::{AttError, AttErrorCode};
use crate::config::ConfigError;
use crate::gap::AdvertisingError;
use crate::transport::SendError;
use thiserror::Error;

/// Errors raised by the GATT server engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    /// Peer sent a PDU that could not be decoded
    #[error("Malformed PDU: {0}")]
    Decode(AttError),

    /// Outbound PDU could not be encoded
    #[error("Encode failed: {0}")]
    Encode(AttError),

    #[error("Operation not permitted on this attribute")]
    PermissionDenied,

    #[error("Link is not encrypted")]
    InsufficientEncryption,

    #[error("Prepared write offset {offset} does not match buffered length {expected}")]
    OffsetMismatch { offset: u16, expected: usize },

    #[error("Prepared write for handle {0:#06x} exceeds the buffer limit")]
    PrepareQueueFull(u16),

    #[error("Attribute value has an invalid length")]
    InvalidValueLength,

    #[error("No attribute with handle {0:#06x}")]
    NotFound(u16),

    /// A discovery range starting at this handle matched nothing
    #[error("No attributes found from handle {0:#06x}")]
    NoAttributesInRange(u16),

    #[error("Unsupported group type")]
    UnsupportedGroupType,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Indication was not confirmed in time")]
    IndicationTimeout,

    #[error("Application did not answer in time")]
    ResponseTimeout,

    #[error("Application callback failed")]
    CallbackFailed,

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("No attribute handles left")]
    HandlesExhausted,

    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server not started")]
    NotStarted,

    #[error("Peer is not subscribed to handle {0:#06x}")]
    NotSubscribed(u16),

    #[error("Notification queue is full")]
    QueueFull,

    #[error("Too many concurrent sessions")]
    TooManySessions,

    /// Application rejected the request with an application error code
    #[error("Rejected by application with code {0:#04x}")]
    Rejected(u8),

    #[error("Transport error: {0}")]
    Transport(#[from] SendError),

    #[error("Advertising error: {0}")]
    Advertising(#[from] AdvertisingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GattError {
    /// Whether the error ends the session it occurred on
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            GattError::Decode(_)
                | GattError::SessionClosed
                | GattError::IndicationTimeout
                | GattError::ResponseTimeout
                | GattError::Transport(_)
        )
    }

    /// ATT error code reported to the peer for a failed request.
    ///
    /// `is_write` selects between the read and write flavours of a
    /// permission failure.
    pub fn to_att_error_code(&self, is_write: bool) -> AttErrorCode {
        match self {
            GattError::Decode(err) | GattError::Encode(err) => err.to_error_code(),
            GattError::PermissionDenied if is_write => AttErrorCode::WriteNotPermitted,
            GattError::PermissionDenied => AttErrorCode::ReadNotPermitted,
            GattError::InsufficientEncryption => AttErrorCode::InsufficientEncryption,
            GattError::OffsetMismatch { .. } => AttErrorCode::InvalidOffset,
            GattError::PrepareQueueFull(_) => AttErrorCode::PrepareQueueFull,
            GattError::InvalidValueLength => AttErrorCode::InvalidAttributeValueLength,
            GattError::NotFound(_) => AttErrorCode::InvalidHandle,
            GattError::NoAttributesInRange(_) => AttErrorCode::AttributeNotFound,
            GattError::UnsupportedGroupType => AttErrorCode::UnsupportedGroupType,
            GattError::Rejected(code) => match AttErrorCode::from(*code) {
                AttErrorCode::ApplicationError(code) => AttErrorCode::ApplicationError(code),
                _ => AttErrorCode::Unlikely,
            },
            GattError::QueueFull | GattError::TooManySessions => {
                AttErrorCode::InsufficientResources
            }
            _ => AttErrorCode::Unlikely,
        }
    }
}

impl From<AttError> for GattError {
    fn from(err: AttError) -> Self {
        GattError::Decode(err)
    }
}

/// GATT Result type
pub type GattResult<T> = Result<T, GattError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_att_error_mapping() {
        assert_eq!(
            GattError::NotFound(0x0042).to_att_error_code(false),
            AttErrorCode::InvalidHandle
        );
        assert_eq!(
            GattError::PermissionDenied.to_att_error_code(true),
            AttErrorCode::WriteNotPermitted
        );
        assert_eq!(
            GattError::PermissionDenied.to_att_error_code(false),
            AttErrorCode::ReadNotPermitted
        );
        assert_eq!(
            GattError::OffsetMismatch {
                offset: 4,
                expected: 2
            }
            .to_att_error_code(true),
            AttErrorCode::InvalidOffset
        );
        assert_eq!(
            GattError::Rejected(0x81).to_att_error_code(true),
            AttErrorCode::ApplicationError(0x81)
        );
        // Codes outside the application range are not passed through
        assert_eq!(
            GattError::Rejected(0x03).to_att_error_code(true),
            AttErrorCode::Unlikely
        );
    }

    #[test]
    fn test_session_fatal_errors() {
        assert!(GattError::Decode(AttError::UnsupportedOpcode(0x3F)).is_session_fatal());
        assert!(GattError::IndicationTimeout.is_session_fatal());
        assert!(GattError::ResponseTimeout.is_session_fatal());
        assert!(!GattError::PermissionDenied.is_session_fatal());
        assert!(!GattError::NotFound(1).is_session_fatal());
    }
}
