//! Server configuration

use crate::att::{ATT_DEFAULT_MTU, ATT_MAX_MTU};
use crate::gap::AdvertiseOptions;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`ServerConfig::validate`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_mtu {0} outside {min}..={max}", min = ATT_DEFAULT_MTU, max = ATT_MAX_MTU)]
    InvalidMtu(u16),

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// GATT server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Largest ATT MTU the server accepts
    pub max_mtu: u16,
    /// How long the application may take to answer a read or write
    pub response_timeout: Duration,
    /// How long a peer may take to confirm an indication
    pub indication_timeout: Duration,
    /// Sessions allowed at once
    pub max_concurrent_sessions: usize,
    /// Notifications and indications queued per session
    pub max_queued_notifications: usize,
    /// Largest value a long write may assemble for one handle
    pub max_prepared_write_len: usize,
    /// Name placed in the advertising payload
    pub device_name: String,
    /// Advertising settings used by `GattServer::start`
    pub advertise: AdvertiseOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_mtu: ATT_MAX_MTU,
            response_timeout: Duration::from_secs(30),
            indication_timeout: Duration::from_secs(30),
            max_concurrent_sessions: 8,
            max_queued_notifications: 32,
            max_prepared_write_len: 512,
            device_name: "rustygatt".to_string(),
            advertise: AdvertiseOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Check the configuration before the server uses it
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(ATT_DEFAULT_MTU..=ATT_MAX_MTU).contains(&self.max_mtu) {
            return Err(ConfigError::InvalidMtu(self.max_mtu));
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::Zero("response_timeout"));
        }
        if self.indication_timeout.is_zero() {
            return Err(ConfigError::Zero("indication_timeout"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::Zero("max_concurrent_sessions"));
        }
        if self.max_queued_notifications == 0 {
            return Err(ConfigError::Zero("max_queued_notifications"));
        }
        if self.max_prepared_write_len == 0 {
            return Err(ConfigError::Zero("max_prepared_write_len"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.max_mtu, 517);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ServerConfig {
            max_mtu: 22,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMtu(22)));

        let config = ServerConfig {
            indication_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("indication_timeout"))
        );
    }
}
