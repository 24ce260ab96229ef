//! Advertising control
//!
//! The engine decides *what* to advertise; an [`Advertiser`] supplied by the
//! platform puts it on air.

use super::constants::*;
use crate::uuid::Uuid;
use log::{info, warn};
use std::time::Duration;
use thiserror::Error;

/// Advertising failures, mirroring the reasons a controller can refuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertisingError {
    #[error("Advertising payload is {0} bytes, limit is 31")]
    DataTooLarge(usize),

    #[error("No advertising instance available")]
    TooManyAdvertisers,

    #[error("Already advertising")]
    AlreadyStarted,

    #[error("Advertising not supported by this controller")]
    FeatureUnsupported,

    #[error("Malformed advertising data")]
    Malformed,

    #[error("Advertiser failed: {0}")]
    Internal(String),
}

/// Advertising interval trade-off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl AdvertiseMode {
    /// Advertising interval in 0.625 ms units
    pub fn interval(&self) -> u16 {
        match self {
            AdvertiseMode::LowPower => 0x0640,   // 1 s
            AdvertiseMode::Balanced => 0x0190,   // 250 ms
            AdvertiseMode::LowLatency => 0x00A0, // 100 ms
        }
    }
}

/// Transmit power level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

impl TxPowerLevel {
    /// Nominal power in dBm
    pub fn dbm(&self) -> i8 {
        match self {
            TxPowerLevel::UltraLow => -21,
            TxPowerLevel::Low => -15,
            TxPowerLevel::Medium => -7,
            TxPowerLevel::High => 1,
        }
    }
}

/// Advertising settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseOptions {
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
    /// Stop after this long; `None` advertises until stopped
    pub timeout: Option<Duration>,
    pub include_device_name: bool,
    pub include_tx_power: bool,
}

impl Default for AdvertiseOptions {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::Balanced,
            tx_power: TxPowerLevel::Medium,
            connectable: true,
            timeout: None,
            include_device_name: true,
            include_tx_power: false,
        }
    }
}

/// Contents of the advertising payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub tx_power: Option<i8>,
}

impl AdvertisingData {
    /// Payload advertising `service_uuids`, built according to `options`
    pub fn for_services(
        device_name: &str,
        service_uuids: Vec<Uuid>,
        options: &AdvertiseOptions,
    ) -> Self {
        Self {
            flags: options
                .connectable
                .then_some(ADV_FLAG_LE_GENERAL_DISCOVERABLE | ADV_FLAG_BR_EDR_NOT_SUPPORTED),
            local_name: options
                .include_device_name
                .then(|| device_name.to_string()),
            service_uuids,
            tx_power: options.include_tx_power.then(|| options.tx_power.dbm()),
        }
    }

    /// Encode as AD structures (length, type, data)
    pub fn to_bytes(&self) -> Result<Vec<u8>, AdvertisingError> {
        let mut out = Vec::with_capacity(ADV_MAX_DATA_LEN);
        let mut push = |ad_type: u8, data: &[u8]| -> Result<(), AdvertisingError> {
            // Length and type bytes share the legacy payload
            if data.len() > ADV_MAX_DATA_LEN - 2 {
                return Err(AdvertisingError::DataTooLarge(out.len() + data.len() + 2));
            }
            out.push(data.len() as u8 + 1);
            out.push(ad_type);
            out.extend_from_slice(data);
            Ok(())
        };

        if let Some(flags) = self.flags {
            push(ADV_TYPE_FLAGS, &[flags])?;
        }

        let short: Vec<u8> = self
            .service_uuids
            .iter()
            .filter_map(Uuid::as_u16)
            .flat_map(u16::to_le_bytes)
            .collect();
        if !short.is_empty() {
            push(ADV_TYPE_16BIT_SERVICE_UUID_COMPLETE, &short)?;
        }
        let long: Vec<u8> = self
            .service_uuids
            .iter()
            .filter(|uuid| uuid.as_u16().is_none())
            .flat_map(|uuid| *uuid.as_bytes_le())
            .collect();
        if !long.is_empty() {
            push(ADV_TYPE_128BIT_SERVICE_UUID_COMPLETE, &long)?;
        }

        if let Some(power) = self.tx_power {
            push(ADV_TYPE_TX_POWER_LEVEL, &power.to_le_bytes())?;
        }
        if let Some(name) = &self.local_name {
            push(ADV_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes())?;
        }

        if out.len() > ADV_MAX_DATA_LEN {
            return Err(AdvertisingError::DataTooLarge(out.len()));
        }
        Ok(out)
    }

    /// Decode AD structures, as a scanner would
    pub fn parse(data: &[u8]) -> Result<Self, AdvertisingError> {
        let mut parsed = AdvertisingData::default();

        for (ad_type, value) in parse_ad_structures(data)? {
            match ad_type {
                ADV_TYPE_FLAGS => parsed.flags = value.first().copied(),
                ADV_TYPE_16BIT_SERVICE_UUID_COMPLETE | ADV_TYPE_16BIT_SERVICE_UUID_PARTIAL => {
                    parsed.service_uuids.extend(
                        value
                            .chunks_exact(2)
                            .map(|c| Uuid::from_u16(u16::from_le_bytes([c[0], c[1]]))),
                    );
                }
                ADV_TYPE_128BIT_SERVICE_UUID_COMPLETE | ADV_TYPE_128BIT_SERVICE_UUID_PARTIAL => {
                    parsed
                        .service_uuids
                        .extend(value.chunks_exact(16).filter_map(Uuid::from_att_bytes));
                }
                ADV_TYPE_COMPLETE_LOCAL_NAME | ADV_TYPE_SHORT_LOCAL_NAME => {
                    parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
                ADV_TYPE_TX_POWER_LEVEL => {
                    parsed.tx_power = value.first().map(|p| *p as i8);
                }
                _ => {}
            }
        }

        Ok(parsed)
    }
}

/// Split an advertising payload into (type, data) pairs
pub fn parse_ad_structures(data: &[u8]) -> Result<Vec<(u8, &[u8])>, AdvertisingError> {
    let mut result = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let length = data[i] as usize;
        // Zero length terminates the significant part
        if length == 0 {
            break;
        }
        if i + 1 + length > data.len() {
            return Err(AdvertisingError::Malformed);
        }

        result.push((data[i + 1], &data[i + 2..i + 1 + length]));
        i += 1 + length;
    }

    Ok(result)
}

/// Platform hook that puts advertising on air
pub trait Advertiser: Send {
    /// Whether the controller can advertise while connected
    fn is_supported(&self) -> bool {
        true
    }

    /// Start advertising `data`
    fn start_advertising(
        &mut self,
        data: &AdvertisingData,
        options: &AdvertiseOptions,
    ) -> Result<(), AdvertisingError>;

    /// Stop advertising
    fn stop_advertising(&mut self);
}

/// Starts and stops advertising, at most once at a time
pub struct AdvertisingController {
    advertiser: Box<dyn Advertiser>,
    active: bool,
}

impl AdvertisingController {
    /// Wrap a platform advertiser
    pub fn new(advertiser: Box<dyn Advertiser>) -> Self {
        Self {
            advertiser,
            active: false,
        }
    }

    /// Validate the payload and start advertising
    pub fn start(
        &mut self,
        data: &AdvertisingData,
        options: &AdvertiseOptions,
    ) -> Result<(), AdvertisingError> {
        if self.active {
            return Err(AdvertisingError::AlreadyStarted);
        }
        if !self.advertiser.is_supported() {
            return Err(AdvertisingError::FeatureUnsupported);
        }
        let payload = data.to_bytes()?;

        if let Err(err) = self.advertiser.start_advertising(data, options) {
            warn!("Failed to start advertising: {}", err);
            return Err(err);
        }
        self.active = true;
        info!(
            "Started advertising ({} bytes, {:?}, {:?})",
            payload.len(),
            options.mode,
            options.tx_power
        );
        Ok(())
    }

    /// Stop advertising if active
    pub fn stop(&mut self) {
        if self.active {
            self.advertiser.stop_advertising();
            self.active = false;
            info!("Stopped advertising");
        }
    }

    /// Whether advertising is on
    pub fn is_advertising(&self) -> bool {
        self.active
    }
}

impl Drop for AdvertisingController {
    fn drop(&mut self) {
        self.stop();
    }
}
