//! Attribute Protocol (ATT) implementation
//!
//! PDU definitions and the codec the GATT server engine uses to talk to a
//! peer over an already-framed ATT bearer.

pub mod codec;
pub mod constants;
pub mod error;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::codec::{decode, encode, ExecuteFlag, ParsedRequest, Response, WriteKind};
pub use self::constants::*;
pub use self::error::{AttError, AttErrorCode, AttResult};
pub use self::types::*;
