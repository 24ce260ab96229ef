//! Request dispatcher
//!
//! Turns one inbound PDU into at most one response: decode, permission
//! checks, the application callback, then the registry or session update.

use super::registry::{Attribute, AttributeKind, CharacteristicEntry, ServiceRegistry};
use super::server::GattApplication;
use super::session::Session;
use super::types::*;
use crate::att::{
    self, AttError, AttributeData, ExchangeMtuResponse, ExecuteFlag, FindInformationResponse,
    HandleValue, ParsedRequest, PrepareWriteResponse, ReadBlobResponse, ReadByGroupTypeResponse,
    ReadByTypeResponse, ReadResponse, Response, WriteKind, ATT_COMMAND_FLAG, ATT_EXECUTE_WRITE_REQ, ATT_PREPARE_HEADER_SIZE, PRIMARY_SERVICE_UUID,
    SECONDARY_SERVICE_UUID,
};
use crate::config::ServerConfig;
use crate::error::{GattError, GattResult};
use crate::transport::Transport;
use crate::uuid::Uuid;
use log::{debug, error, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

/// Result of dispatching one PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// PDU to send back, if the request calls for one
    pub response: Option<Response>,
    /// Set when the session must be torn down after the response goes out
    pub fatal: Option<GattError>,
}

impl DispatchOutcome {
    fn silent() -> Self {
        Self {
            response: None,
            fatal: None,
        }
    }
}

/// Serves ATT requests against the registry on behalf of one session at a time
pub struct RequestDispatcher {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    app: Arc<dyn GattApplication>,
    config: Arc<ServerConfig>,
}

impl RequestDispatcher {
    /// Create a dispatcher
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn Transport>,
        app: Arc<dyn GattApplication>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            registry,
            transport,
            app,
            config,
        }
    }

    /// Handle one inbound PDU for `session`
    pub fn dispatch(&self, session: &Arc<Session>, pdu: &[u8]) -> DispatchOutcome {
        let mtu = session.mtu();
        let decoded = if pdu.len() > mtu as usize {
            Err(AttError::PduTooLong {
                len: pdu.len(),
                mtu,
            })
        } else {
            att::decode(pdu)
        };
        let request = match decoded {
            Ok(request) => request,
            Err(AttError::UnsupportedOpcode(opcode)) if opcode & ATT_COMMAND_FLAG != 0 => {
                debug!("{}: ignoring unknown command {:#04x}", session.id(), opcode);
                return DispatchOutcome::silent();
            }
            Err(err) => {
                warn!("{}: malformed PDU: {}", session.id(), err);
                let opcode = pdu.first().copied().unwrap_or_default();
                return DispatchOutcome {
                    response: Some(Response::error(opcode, 0, err.to_error_code())),
                    fatal: Some(GattError::Decode(err)),
                };
            }
        };
        debug!("{}: {:?}", session.id(), request);

        if !matches!(request, ParsedRequest::ExchangeMtu { .. }) && session.mark_ready() {
            self.app
                .on_session_state_changed(session.id(), SessionState::Ready);
        }

        let result = match &request {
            ParsedRequest::ExchangeMtu { client_mtu } => {
                self.handle_exchange_mtu(session, *client_mtu)
            }
            ParsedRequest::Read { handle } => self.handle_read(session, *handle, 0, false),
            ParsedRequest::ReadBlob { handle, offset } => {
                self.handle_read(session, *handle, *offset, true)
            }
            ParsedRequest::Write {
                handle,
                offset,
                value,
                kind,
            } => self.handle_write(session, *handle, *offset, value, *kind),
            ParsedRequest::ExecuteWrite { flag } => self.handle_execute_write(session, *flag),
            ParsedRequest::Confirmation => self.handle_confirmation(session),
            ParsedRequest::ReadByGroupType {
                start_handle,
                end_handle,
                group_type,
            } => self.handle_read_by_group_type(session, *start_handle, *end_handle, *group_type),
            ParsedRequest::ReadByType {
                start_handle,
                end_handle,
                attribute_type,
            } => self.handle_read_by_type(session, *start_handle, *end_handle, *attribute_type),
            ParsedRequest::FindInformation {
                start_handle,
                end_handle,
            } => self.handle_find_information(session, *start_handle, *end_handle),
        };

        match result {
            Ok(response) => DispatchOutcome {
                response,
                fatal: None,
            },
            // Nobody left to answer
            Err(GattError::SessionClosed) => DispatchOutcome::silent(),
            Err(err) => {
                debug!("{}: {:?} failed: {}", session.id(), request, err);
                DispatchOutcome {
                    response: request
                        .needs_response()
                        .then(|| Self::error_response(&request, &err)),
                    fatal: err.is_session_fatal().then_some(err),
                }
            }
        }
    }

    fn error_response(request: &ParsedRequest, err: &GattError) -> Response {
        let handle = match err {
            GattError::NotFound(handle)
            | GattError::NoAttributesInRange(handle)
            | GattError::PrepareQueueFull(handle) => *handle,
            _ => request.handle(),
        };
        let is_write = matches!(
            request,
            ParsedRequest::Write { .. } | ParsedRequest::ExecuteWrite { .. }
        );
        Response::error(request.opcode(), handle, err.to_att_error_code(is_write))
    }

    /// Run an application callback on a helper thread, bounded by the
    /// response timeout. A late result goes nowhere.
    fn call_app<T, F>(&self, callback: F) -> GattResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn GattApplication) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let app = Arc::clone(&self.app);
        thread::Builder::new()
            .name("gatt-callback".to_string())
            .spawn(move || {
                let _ = tx.send(callback(app.as_ref()));
            })
            .map_err(|err| GattError::Spawn(err.to_string()))?;

        match rx.recv_timeout(self.config.response_timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Application callback exceeded {:?}",
                    self.config.response_timeout
                );
                Err(GattError::ResponseTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Application callback panicked");
                Err(GattError::CallbackFailed)
            }
        }
    }

    fn check_read(&self, session: &Session, entry: &CharacteristicEntry) -> GattResult<()> {
        if !entry.properties.contains(CharacteristicProperties::READ)
            || !entry.permissions.readable()
        {
            return Err(GattError::PermissionDenied);
        }
        if !entry.permissions.contains(Permissions::READ)
            && !self.transport.is_encrypted(session.id())
        {
            return Err(GattError::InsufficientEncryption);
        }
        Ok(())
    }

    fn check_write(
        &self,
        session: &Session,
        entry: &CharacteristicEntry,
        kind: WriteKind,
    ) -> GattResult<()> {
        let property = match kind {
            WriteKind::Command => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            WriteKind::Request | WriteKind::Prepare => CharacteristicProperties::WRITE,
        };
        if !entry.properties.contains(property) || !entry.permissions.writable() {
            return Err(GattError::PermissionDenied);
        }
        if !entry.permissions.contains(Permissions::WRITE)
            && !self.transport.is_encrypted(session.id())
        {
            return Err(GattError::InsufficientEncryption);
        }
        Ok(())
    }

    fn handle_exchange_mtu(&self, session: &Session, client_mtu: u16) -> GattResult<Option<Response>> {
        let previous_state = session.state();
        let previous_mtu = session.mtu();
        let mtu = session.begin_mtu_exchange(client_mtu, self.config.max_mtu)?;

        if previous_state == SessionState::Connecting && session.state() == SessionState::Ready {
            self.app
                .on_session_state_changed(session.id(), SessionState::Ready);
        }
        if mtu != previous_mtu {
            self.app.on_mtu_changed(session.id(), mtu);
        }

        Ok(Some(Response::ExchangeMtu(ExchangeMtuResponse { server_mtu: mtu })))
    }

    fn handle_read(
        &self,
        session: &Session,
        handle: u16,
        offset: u16,
        blob: bool,
    ) -> GattResult<Option<Response>> {
        let attribute = self.registry.lookup_attribute(handle)?;
        let max = session.mtu() as usize - 1;

        let value = match attribute.kind {
            AttributeKind::Value => {
                let entry = self.registry.lookup(handle)?;
                self.check_read(session, &entry)?;

                let id = session.id();
                session.read_chunk(handle, offset, max, || {
                    match self.call_app(move |app| app.on_read(id, handle, offset))? {
                        Some(value) => Ok(Arc::from(value)),
                        None => self.registry.current_value(handle),
                    }
                })?
            }
            AttributeKind::Cccd => {
                let cccd = self.cccd_value(session, &attribute)?;
                session.read_chunk(handle, offset, max, || Ok(cccd))?
            }
            AttributeKind::ServiceDeclaration | AttributeKind::CharacteristicDeclaration => {
                session.read_chunk(handle, offset, max, || self.registry.current_value(handle))?
            }
        };

        Ok(Some(if blob {
            Response::ReadBlob(ReadBlobResponse { value })
        } else {
            Response::Read(ReadResponse { value })
        }))
    }

    fn cccd_value(&self, session: &Session, attribute: &Attribute) -> GattResult<Arc<[u8]>> {
        let value_handle = attribute
            .characteristic
            .ok_or(GattError::NotFound(attribute.handle))?;
        let bits = session.subscription(value_handle).to_cccd();
        Ok(Arc::from(bits.to_le_bytes().to_vec()))
    }

    fn handle_write(
        &self,
        session: &Session,
        handle: u16,
        offset: u16,
        value: &[u8],
        kind: WriteKind,
    ) -> GattResult<Option<Response>> {
        let attribute = self.registry.lookup_attribute(handle)?;
        match attribute.kind {
            AttributeKind::Value => {}
            AttributeKind::Cccd => return self.handle_cccd_write(session, &attribute, value, kind),
            _ => return Err(GattError::PermissionDenied),
        }

        let entry = self.registry.lookup(handle)?;
        self.check_write(session, &entry, kind)?;

        if kind == WriteKind::Prepare {
            // The echo has to fit the same MTU
            if value.len() > session.mtu() as usize - ATT_PREPARE_HEADER_SIZE {
                return Err(GattError::InvalidValueLength);
            }
            session.prepare_write(handle, offset, value, self.config.max_prepared_write_len)?;
            return Ok(Some(Response::PrepareWrite(PrepareWriteResponse {
                handle,
                offset,
                value: value.to_vec(),
            })));
        }

        let id = session.id();
        let owned = value.to_vec();
        match self.call_app(move |app| app.on_write(id, handle, 0, &owned))? {
            WriteOutcome::Accept => {}
            WriteOutcome::Reject(code) => return Err(GattError::Rejected(code)),
        }
        session.commit_writes(&self.registry, vec![(handle, Arc::from(value))])?;

        Ok((kind == WriteKind::Request).then_some(Response::Write))
    }

    fn handle_cccd_write(
        &self,
        session: &Session,
        attribute: &Attribute,
        value: &[u8],
        kind: WriteKind,
    ) -> GattResult<Option<Response>> {
        if kind == WriteKind::Prepare {
            return Err(GattError::PermissionDenied);
        }
        let bits = match value {
            [low, high] => u16::from_le_bytes([*low, *high]),
            _ => return Err(GattError::InvalidValueLength),
        };

        let entry = self.registry.lookup(attribute.handle)?;
        let requested = Subscription::from_cccd(bits);
        let subscription = Subscription {
            notify: requested.notify
                && entry.properties.contains(CharacteristicProperties::NOTIFY),
            indicate: requested.indicate
                && entry.properties.contains(CharacteristicProperties::INDICATE),
        };
        if subscription != requested {
            warn!(
                "{}: CCCD {:#06x} asked for {:#06x}, characteristic supports less",
                session.id(),
                attribute.handle,
                bits
            );
        }
        session.set_subscription(entry.value_handle, subscription)?;
        debug!(
            "{}: subscription for {:#06x} now {:?}",
            session.id(),
            entry.value_handle,
            subscription
        );

        Ok((kind == WriteKind::Request).then_some(Response::Write))
    }

    fn handle_execute_write(&self, session: &Session, flag: ExecuteFlag) -> GattResult<Option<Response>> {
        let prepared = session.take_prepared()?;
        if flag == ExecuteFlag::Cancel || prepared.is_empty() {
            debug!("{}: discarded {} prepared writes", session.id(), prepared.len());
            return Ok(Some(Response::ExecuteWrite));
        }

        let id = session.id();
        let writes = prepared.clone();
        let rejected = self.call_app(move |app| {
            writes
                .iter()
                .find_map(|(handle, value)| match app.on_write(id, *handle, 0, value) {
                    WriteOutcome::Accept => None,
                    WriteOutcome::Reject(code) => Some((*handle, code)),
                })
        })?;
        if let Some((handle, code)) = rejected {
            debug!("{}: long write to {:#06x} rejected", id, handle);
            return Ok(Some(Response::error(
                ATT_EXECUTE_WRITE_REQ,
                handle,
                GattError::Rejected(code).to_att_error_code(true),
            )));
        }

        let batch: Vec<(u16, Arc<[u8]>)> = prepared
            .into_iter()
            .map(|(handle, value)| (handle, Arc::from(value)))
            .collect();
        session.commit_writes(&self.registry, batch)?;
        Ok(Some(Response::ExecuteWrite))
    }

    fn handle_confirmation(&self, session: &Session) -> GattResult<Option<Response>> {
        if !session.confirm_indication() {
            warn!("{}: confirmation without an outstanding indication", session.id());
            return Ok(None);
        }
        session.pump(self.transport.as_ref(), self.config.indication_timeout)?;
        Ok(None)
    }

    fn check_range(start: u16, end: u16) -> GattResult<()> {
        if start == 0 || start > end {
            return Err(GattError::NotFound(start));
        }
        Ok(())
    }

    fn handle_read_by_group_type(
        &self,
        session: &Session,
        start: u16,
        end: u16,
        group_type: Uuid,
    ) -> GattResult<Option<Response>> {
        Self::check_range(start, end)?;
        let service_type = match group_type.as_u16() {
            Some(PRIMARY_SERVICE_UUID) => ServiceType::Primary,
            Some(SECONDARY_SERVICE_UUID) => ServiceType::Secondary,
            _ => return Err(GattError::UnsupportedGroupType),
        };

        let services = self.registry.services_in_range(start, end, service_type);
        let first = services.first().ok_or(GattError::NoAttributesInRange(start))?;
        let value_len = first.uuid.to_att_bytes().len();
        let item_len = 4 + value_len;
        let budget = session.mtu() as usize - 2;

        let data: Vec<AttributeData> = services
            .iter()
            .map(|service| (service, service.uuid.to_att_bytes()))
            .take_while(|(_, value)| value.len() == value_len)
            .take(budget / item_len)
            .map(|(service, value)| AttributeData {
                handle: service.start_handle,
                end_group_handle: service.end_handle,
                value,
            })
            .collect();

        Ok(Some(Response::ReadByGroupType(ReadByGroupTypeResponse {
            length: item_len as u8,
            data,
        })))
    }

    fn discovery_value(&self, session: &Session, attribute: &Attribute) -> GattResult<Arc<[u8]>> {
        match attribute.kind {
            AttributeKind::Value => {
                let entry = self.registry.lookup(attribute.handle)?;
                self.check_read(session, &entry)?;
                self.registry.current_value(attribute.handle)
            }
            AttributeKind::Cccd => self.cccd_value(session, attribute),
            _ => self.registry.current_value(attribute.handle),
        }
    }

    fn handle_read_by_type(
        &self,
        session: &Session,
        start: u16,
        end: u16,
        attribute_type: Uuid,
    ) -> GattResult<Option<Response>> {
        Self::check_range(start, end)?;
        let attributes = self.registry.attributes_of_type(start, end, attribute_type);
        if attributes.is_empty() {
            return Err(GattError::NoAttributesInRange(start));
        }

        let mtu = session.mtu() as usize;
        let max_value = (mtu - 4).min(253);
        let budget = mtu - 2;
        let mut data = Vec::new();
        let mut item_len = None;
        let mut used = 0;

        for attribute in &attributes {
            let value = match self.discovery_value(session, attribute) {
                Ok(value) => value,
                Err(err) if data.is_empty() => return Err(err),
                Err(_) => break,
            };
            let value = value[..value.len().min(max_value)].to_vec();
            let len = 2 + value.len();
            if *item_len.get_or_insert(len) != len || used + len > budget {
                break;
            }
            used += len;
            data.push(HandleValue {
                handle: attribute.handle,
                value,
            });
        }

        Ok(Some(Response::ReadByType(ReadByTypeResponse {
            length: item_len.unwrap_or(2) as u8,
            data,
        })))
    }

    fn handle_find_information(
        &self,
        session: &Session,
        start: u16,
        end: u16,
    ) -> GattResult<Option<Response>> {
        Self::check_range(start, end)?;
        let attributes = self.registry.attributes_in_range(start, end);
        let first = attributes
            .first()
            .ok_or(GattError::NoAttributesInRange(start))?;
        let uuid_len = first.attribute_type.to_att_bytes().len();
        let per_entry = 2 + uuid_len;
        let budget = session.mtu() as usize - 2;

        let entries = attributes
            .iter()
            .take_while(|attribute| attribute.attribute_type.to_att_bytes().len() == uuid_len)
            .take(budget / per_entry)
            .map(|attribute| (attribute.handle, attribute.attribute_type))
            .collect();

        Ok(Some(Response::FindInformation(FindInformationResponse {
            entries,
        })))
    }
}

