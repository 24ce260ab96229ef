//! Common types for GATT services
//!
//! A [`Service`] is a plain description handed to the server before it
//! starts. Handles are assigned by the registry at registration time.

use crate::uuid::Uuid;

bitflags::bitflags! {
    /// Characteristic properties, as carried in the characteristic declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        const READ = 0x02;
        /// Write Command, no response
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Write Request and long writes
        const WRITE = 0x08;
        /// Requires a CCCD
        const NOTIFY = 0x10;
        /// Requires a CCCD
        const INDICATE = 0x20;
    }
}

bitflags::bitflags! {
    /// Access permissions on a characteristic value.
    ///
    /// The `*_ENCRYPTED` flags grant access only over an encrypted link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permissions: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const READ_ENCRYPTED = 0x04;
        const WRITE_ENCRYPTED = 0x08;
    }
}

impl Permissions {
    /// Whether any form of read access is granted
    pub fn readable(&self) -> bool {
        self.intersects(Permissions::READ | Permissions::READ_ENCRYPTED)
    }

    /// Whether any form of write access is granted
    pub fn writable(&self) -> bool {
        self.intersects(Permissions::WRITE | Permissions::WRITE_ENCRYPTED)
    }
}

/// Primary or secondary service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Primary,
    Secondary,
}

/// A characteristic description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Characteristic properties
    pub properties: CharacteristicProperties,
    /// Value permissions
    pub permissions: Permissions,
    /// Value the registry starts with
    pub initial_value: Vec<u8>,
}

impl Characteristic {
    /// Create a characteristic with an empty initial value
    pub fn new(uuid: Uuid, properties: CharacteristicProperties, permissions: Permissions) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            initial_value: Vec::new(),
        }
    }

    /// Set the initial value
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.initial_value = value.into();
        self
    }

    /// Whether a Client Characteristic Configuration descriptor is needed
    pub fn has_cccd(&self) -> bool {
        self.properties
            .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
    }
}

/// A service description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service UUID
    pub uuid: Uuid,
    /// Primary or secondary
    pub service_type: ServiceType,
    /// Characteristics in handle order
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Create an empty primary service
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            service_type: ServiceType::Primary,
            characteristics: Vec::new(),
        }
    }

    /// Create an empty secondary service
    pub fn secondary(uuid: Uuid) -> Self {
        Self {
            uuid,
            service_type: ServiceType::Secondary,
            characteristics: Vec::new(),
        }
    }

    /// Append a characteristic
    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Number of handles this service occupies
    pub(crate) fn handle_count(&self) -> usize {
        1 + self
            .characteristics
            .iter()
            .map(|c| if c.has_cccd() { 3 } else { 2 })
            .sum::<usize>()
    }
}

/// Handles assigned to one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandles {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Declaration handle
    pub declaration_handle: u16,
    /// Value handle
    pub value_handle: u16,
    /// CCCD handle, present for notify/indicate characteristics
    pub cccd_handle: Option<u16>,
}

/// Handles assigned to a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandles {
    /// Service declaration handle
    pub service_handle: u16,
    /// Last handle of the service
    pub end_handle: u16,
    /// Characteristics in registration order
    pub characteristics: Vec<CharacteristicHandles>,
}

impl ServiceHandles {
    /// Value handle of the first characteristic with this UUID
    pub fn value_handle(&self, uuid: Uuid) -> Option<u16> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| c.value_handle)
    }
}

/// Session-scoped CCCD state for one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subscription {
    pub notify: bool,
    pub indicate: bool,
}

impl Subscription {
    /// Decode a CCCD value (2 bytes, little-endian)
    pub fn from_cccd(bits: u16) -> Self {
        Self {
            notify: bits & crate::att::CCCD_NOTIFY != 0,
            indicate: bits & crate::att::CCCD_INDICATE != 0,
        }
    }

    /// Encode as a CCCD value
    pub fn to_cccd(self) -> u16 {
        let mut bits = 0;
        if self.notify {
            bits |= crate::att::CCCD_NOTIFY;
        }
        if self.indicate {
            bits |= crate::att::CCCD_INDICATE;
        }
        bits
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Negotiating = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Connecting,
            1 => SessionState::Negotiating,
            2 => SessionState::Ready,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Whether requests may still be served
    pub fn is_open(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Negotiating | SessionState::Ready
        )
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport reported a disconnect
    PeerDisconnected,
    /// Peer sent something undecodable
    ProtocolError,
    /// Indication was not confirmed in time
    IndicationTimeout,
    /// Application did not answer in time
    ResponseTimeout,
    /// Transport refused a send
    TransportFailure,
    /// Application asked to drop the peer
    LocalDisconnect,
    /// No worker thread could be started
    Internal,
    /// Server stopped
    ServerStopped,
}

/// Application verdict on a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accept,
    /// Reject with an application error code (0x80..=0x9F)
    Reject(u8),
}
