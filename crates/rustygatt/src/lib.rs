//! RustyGatt - A Bluetooth LE GATT peripheral server engine
//!
//! This library hosts GATT services for remote centrals. It owns the ATT wire
//! codec, the attribute table, per-peer sessions with MTU negotiation and
//! long reads/writes, notification and indication delivery, and the
//! advertising payload. Radio access is left to the embedding platform through
//! the [`Transport`](transport::Transport) and
//! [`Advertiser`](gap::Advertiser) traits.

pub mod att;
pub mod config;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod transport;
pub mod uuid;

// Re-export common types for convenience
pub use att::{AttError, AttErrorCode, ParsedRequest, Response};
pub use config::{ConfigError, ServerConfig};
pub use error::{GattError, GattResult};
pub use gap::{AdvertiseOptions, Advertiser, AdvertisingController, AdvertisingData};
pub use gatt::{
    Characteristic, CharacteristicProperties, GattApplication, GattServer, Permissions, Service,
    ServiceHandles, SessionState, WriteOutcome,
};
pub use transport::{SendError, SessionId, Transport, TransportEvent};
pub use uuid::Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_rejects_invalid_config() {
        struct NullTransport;
        impl Transport for NullTransport {
            fn send(&self, _: SessionId, _: &[u8]) -> Result<(), SendError> {
                Ok(())
            }
            fn disconnect(&self, _: SessionId) {}
        }

        let config = ServerConfig {
            max_concurrent_sessions: 0,
            ..Default::default()
        };
        let result = GattServer::new(
            config,
            std::sync::Arc::new(NullTransport),
            std::sync::Arc::new(gatt::NoopApplication),
        );
        assert!(matches!(
            result,
            Err(GattError::Config(ConfigError::Zero("max_concurrent_sessions")))
        ));
    }
}
