//! Service registry
//!
//! Owns the attribute table and the current characteristic values. Values are
//! stored as `Arc<[u8]>` so a reader keeps a stable snapshot while the single
//! writer swaps in a new value.

use super::types::*;
use crate::att::{
    ATT_HANDLE_MAX, ATT_HANDLE_MIN, CHARACTERISTIC_UUID, CLIENT_CHAR_CONFIG_UUID,
    PRIMARY_SERVICE_UUID, SECONDARY_SERVICE_UUID,
};
use crate::error::{GattError, GattResult};
use crate::uuid::Uuid;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// What an attribute handle points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Primary or secondary service declaration
    ServiceDeclaration,
    /// Characteristic declaration
    CharacteristicDeclaration,
    /// Characteristic value
    Value,
    /// Client Characteristic Configuration descriptor
    Cccd,
}

/// One row of the attribute table
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Attribute handle
    pub handle: u16,
    /// Attribute type
    pub attribute_type: Uuid,
    /// What the handle points at
    pub kind: AttributeKind,
    /// Value handle of the owning characteristic, if any
    pub characteristic: Option<u16>,
    /// Fixed value of declarations
    pub(crate) static_value: Option<Arc<[u8]>>,
}

/// Metadata of a registered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicEntry {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the owning service
    pub service_uuid: Uuid,
    /// Characteristic properties
    pub properties: CharacteristicProperties,
    /// Value permissions
    pub permissions: Permissions,
    /// Declaration handle
    pub declaration_handle: u16,
    /// Value handle
    pub value_handle: u16,
    /// CCCD handle
    pub cccd_handle: Option<u16>,
}

/// A registered service's handle range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRange {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub start_handle: u16,
    pub end_handle: u16,
}

#[derive(Debug)]
struct Table {
    attributes: BTreeMap<u16, Attribute>,
    characteristics: BTreeMap<u16, CharacteristicEntry>,
    services: Vec<ServiceRange>,
    next_handle: u32,
}

/// Attribute table plus characteristic values
#[derive(Debug)]
pub struct ServiceRegistry {
    frozen: AtomicBool,
    table: RwLock<Table>,
    values: RwLock<HashMap<u16, Arc<[u8]>>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            frozen: AtomicBool::new(false),
            table: RwLock::new(Table {
                attributes: BTreeMap::new(),
                characteristics: BTreeMap::new(),
                services: Vec::new(),
                next_handle: ATT_HANDLE_MIN as u32,
            }),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service, assigning handles in order
    pub fn register(&self, service: Service) -> GattResult<ServiceHandles> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_frozen() {
            return Err(GattError::AlreadyStarted);
        }

        let first = table.next_handle;
        if first + service.handle_count() as u32 - 1 > ATT_HANDLE_MAX as u32 {
            return Err(GattError::HandlesExhausted);
        }

        let mut next = first as u16;
        let mut alloc = || {
            let handle = next;
            next = next.wrapping_add(1);
            handle
        };

        let service_handle = alloc();
        let declaration_type = match service.service_type {
            ServiceType::Primary => PRIMARY_SERVICE_UUID,
            ServiceType::Secondary => SECONDARY_SERVICE_UUID,
        };
        table.attributes.insert(
            service_handle,
            Attribute {
                handle: service_handle,
                attribute_type: Uuid::from_u16(declaration_type),
                kind: AttributeKind::ServiceDeclaration,
                characteristic: None,
                static_value: Some(service.uuid.to_att_bytes().into()),
            },
        );

        let mut characteristics = Vec::with_capacity(service.characteristics.len());
        let mut initial_values: Vec<(u16, Arc<[u8]>)> =
            Vec::with_capacity(service.characteristics.len());
        let mut end_handle = service_handle;

        for characteristic in service.characteristics {
            let declaration_handle = alloc();
            let value_handle = alloc();
            let cccd_handle = characteristic.has_cccd().then(&mut alloc);
            end_handle = cccd_handle.unwrap_or(value_handle);

            // Declaration value: properties, value handle, UUID
            let mut declaration = vec![characteristic.properties.bits()];
            declaration.extend_from_slice(&value_handle.to_le_bytes());
            declaration.extend_from_slice(&characteristic.uuid.to_att_bytes());

            table.attributes.insert(
                declaration_handle,
                Attribute {
                    handle: declaration_handle,
                    attribute_type: Uuid::from_u16(CHARACTERISTIC_UUID),
                    kind: AttributeKind::CharacteristicDeclaration,
                    characteristic: Some(value_handle),
                    static_value: Some(declaration.into()),
                },
            );
            table.attributes.insert(
                value_handle,
                Attribute {
                    handle: value_handle,
                    attribute_type: characteristic.uuid,
                    kind: AttributeKind::Value,
                    characteristic: Some(value_handle),
                    static_value: None,
                },
            );
            if let Some(cccd) = cccd_handle {
                table.attributes.insert(
                    cccd,
                    Attribute {
                        handle: cccd,
                        attribute_type: Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID),
                        kind: AttributeKind::Cccd,
                        characteristic: Some(value_handle),
                        static_value: None,
                    },
                );
            }

            table.characteristics.insert(
                value_handle,
                CharacteristicEntry {
                    uuid: characteristic.uuid,
                    service_uuid: service.uuid,
                    properties: characteristic.properties,
                    permissions: characteristic.permissions,
                    declaration_handle,
                    value_handle,
                    cccd_handle,
                },
            );
            initial_values.push((value_handle, Arc::from(characteristic.initial_value)));
            characteristics.push(CharacteristicHandles {
                uuid: characteristic.uuid,
                declaration_handle,
                value_handle,
                cccd_handle,
            });
        }

        table.services.push(ServiceRange {
            uuid: service.uuid,
            service_type: service.service_type,
            start_handle: service_handle,
            end_handle,
        });
        table.next_handle = end_handle as u32 + 1;

        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(initial_values);

        info!(
            "Registered service {} at handles {:#06x}..={:#06x}",
            service.uuid, service_handle, end_handle
        );

        Ok(ServiceHandles {
            service_handle,
            end_handle,
            characteristics,
        })
    }

    /// Reject further registrations, after any registration in progress
    pub fn freeze(&self) {
        let _table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Allow registrations again after the server stopped
    pub(crate) fn thaw(&self) {
        let _table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        self.frozen.store(false, Ordering::SeqCst);
    }

    /// Whether the registry is frozen
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Characteristic owning a value or CCCD handle
    pub fn lookup(&self, handle: u16) -> GattResult<CharacteristicEntry> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .attributes
            .get(&handle)
            .and_then(|attr| match attr.kind {
                AttributeKind::Value | AttributeKind::Cccd => attr.characteristic,
                _ => None,
            })
            .and_then(|value_handle| table.characteristics.get(&value_handle))
            .copied()
            .ok_or(GattError::NotFound(handle))
    }

    /// Attribute table row for any handle
    pub fn lookup_attribute(&self, handle: u16) -> GattResult<Attribute> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .attributes
            .get(&handle)
            .cloned()
            .ok_or(GattError::NotFound(handle))
    }

    /// Characteristic by UUID
    pub fn find_characteristic(&self, uuid: Uuid) -> Option<CharacteristicEntry> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .characteristics
            .values()
            .find(|c| c.uuid == uuid)
            .copied()
    }

    /// Current value of a characteristic, or the fixed value of a declaration
    pub fn current_value(&self, handle: u16) -> GattResult<Arc<[u8]>> {
        if let Some(value) = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
        {
            return Ok(Arc::clone(value));
        }

        self.lookup_attribute(handle)?
            .static_value
            .ok_or(GattError::NotFound(handle))
    }

    /// Replace a characteristic value
    pub fn set_value(&self, handle: u16, value: impl Into<Arc<[u8]>>) -> GattResult<()> {
        self.set_values(vec![(handle, value.into())])
    }

    /// Replace several values at once. Either every handle is updated or none.
    pub fn set_values(&self, batch: Vec<(u16, Arc<[u8]>)>) -> GattResult<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((handle, _)) = batch.iter().find(|(h, _)| !values.contains_key(h)) {
            return Err(GattError::NotFound(*handle));
        }
        for (handle, value) in batch {
            debug!("Value of {:#06x} set ({} bytes)", handle, value.len());
            values.insert(handle, value);
        }
        Ok(())
    }

    /// Service declarations of the given type overlapping `start..=end`
    pub fn services_in_range(
        &self,
        start: u16,
        end: u16,
        service_type: ServiceType,
    ) -> Vec<ServiceRange> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .iter()
            .filter(|s| s.service_type == service_type)
            .filter(|s| s.start_handle >= start && s.start_handle <= end)
            .copied()
            .collect()
    }

    /// Attributes of a given type within `start..=end`, in handle order
    pub fn attributes_of_type(&self, start: u16, end: u16, attribute_type: Uuid) -> Vec<Attribute> {
        self.attributes_in_range(start, end)
            .into_iter()
            .filter(|attr| attr.attribute_type == attribute_type)
            .collect()
    }

    /// All attributes within `start..=end`, in handle order
    pub fn attributes_in_range(&self, start: u16, end: u16) -> Vec<Attribute> {
        if start > end {
            return Vec::new();
        }
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .attributes
            .range(start..=end)
            .map(|(_, attr)| attr.clone())
            .collect()
    }

    /// UUIDs of registered primary services
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .iter()
            .filter(|s| s.service_type == ServiceType::Primary)
            .map(|s| s.uuid)
            .collect()
    }
}
