//! GATT Server implementation
//!
//! [`GattServer`] owns the service registry, the session table and the
//! threads that serve peers. A router thread consumes [`TransportEvent`]s and
//! hands each session's PDUs to a dedicated worker, so requests from one peer
//! are answered strictly in order while peers never wait on each other.

use super::dispatcher::RequestDispatcher;
use super::notify::OutboundKind;
use super::registry::ServiceRegistry;
use super::session::{Session, SessionEvent, SessionManager};
use super::types::*;
use crate::att::{self, AttErrorCode, Response};
use crate::config::ServerConfig;
use crate::error::{GattError, GattResult};
use crate::gap::{Advertiser, AdvertisingController, AdvertisingData};
use crate::transport::{SessionId, Transport, TransportEvent};
use log::{debug, error, info, trace, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Application hooks invoked by the server.
///
/// `on_write` and `on_read` run on a helper thread and are bounded by
/// `ServerConfig::response_timeout`; a result arriving later is discarded.
pub trait GattApplication: Send + Sync + 'static {
    /// A client wrote `value` to a characteristic value handle
    fn on_write(&self, _session: SessionId, _handle: u16, _offset: u16, _value: &[u8]) -> WriteOutcome {
        WriteOutcome::Accept
    }

    /// A client started reading a value handle. `None` serves the stored value.
    fn on_read(&self, _session: SessionId, _handle: u16, _offset: u16) -> Option<Vec<u8>> {
        None
    }

    /// A session moved to a new state
    fn on_session_state_changed(&self, _session: SessionId, _state: SessionState) {}

    /// A session settled on its MTU
    fn on_mtu_changed(&self, _session: SessionId, _mtu: u16) {}
}

/// Application that accepts every write and serves stored values
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplication;

impl GattApplication for NoopApplication {}

enum RouterEvent {
    Transport(TransportEvent),
    Shutdown,
}

/// Handle through which a transport feeds events to a running server
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<RouterEvent>,
}

impl EventSender {
    /// Deliver one transport event
    pub fn send(&self, event: TransportEvent) -> GattResult<()> {
        self.tx
            .send(RouterEvent::Transport(event))
            .map_err(|_| GattError::NotStarted)
    }
}

/// State shared by the server handle, the router and the session workers
struct Engine {
    config: Arc<ServerConfig>,
    registry: Arc<ServiceRegistry>,
    sessions: SessionManager,
    transport: Arc<dyn Transport>,
    app: Arc<dyn GattApplication>,
    dispatcher: RequestDispatcher,
}

struct Running {
    events: Sender<RouterEvent>,
    router: JoinHandle<()>,
    advertising: AdvertisingController,
}

/// GATT Server
pub struct GattServer {
    engine: Arc<Engine>,
    running: Mutex<Option<Running>>,
}

impl GattServer {
    /// Create a stopped server
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        app: Arc<dyn GattApplication>,
    ) -> GattResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(ServiceRegistry::new());
        let dispatcher = RequestDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&app),
            Arc::clone(&config),
        );
        let sessions = SessionManager::new(
            config.max_concurrent_sessions,
            config.max_queued_notifications,
        );

        Ok(Self {
            engine: Arc::new(Engine {
                config,
                registry,
                sessions,
                transport,
                app,
                dispatcher,
            }),
            running: Mutex::new(None),
        })
    }

    /// Add a service. Only allowed while the server is stopped.
    pub fn register_service(&self, service: Service) -> GattResult<ServiceHandles> {
        self.engine.registry.register(service)
    }

    /// Freeze the registry, start serving and start advertising
    pub fn start(&self, advertiser: Box<dyn Advertiser>) -> GattResult<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(GattError::AlreadyStarted);
        }

        let engine = &self.engine;
        engine.registry.freeze();

        let mut advertising = AdvertisingController::new(advertiser);
        let data = AdvertisingData::for_services(
            &engine.config.device_name,
            engine.registry.service_uuids(),
            &engine.config.advertise,
        );
        if let Err(err) = advertising.start(&data, &engine.config.advertise) {
            engine.registry.thaw();
            return Err(err.into());
        }

        let (tx, rx) = mpsc::channel();
        let router_engine = Arc::clone(engine);
        let router = match thread::Builder::new()
            .name("gatt-router".to_string())
            .spawn(move || router_engine.route(rx))
        {
            Ok(router) => router,
            Err(err) => {
                advertising.stop();
                engine.registry.thaw();
                return Err(GattError::Spawn(err.to_string()));
            }
        };

        *running = Some(Running {
            events: tx,
            router,
            advertising,
        });
        info!("GATT server started");
        Ok(())
    }

    /// Close every session, stop advertising and stop the router
    pub fn stop(&self) -> GattResult<()> {
        let Running {
            events,
            router,
            mut advertising,
        } = self.lock_running().take().ok_or(GattError::NotStarted)?;

        advertising.stop();
        let _ = events.send(RouterEvent::Shutdown);
        if router.join().is_err() {
            error!("Router thread panicked");
        }
        for session in self.engine.sessions.sessions() {
            self.engine.close_session(session.id(), CloseReason::ServerStopped);
        }
        self.engine.registry.thaw();
        info!("GATT server stopped");
        Ok(())
    }

    /// Whether the server is running
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Sender a transport uses to deliver events
    pub fn event_sender(&self) -> GattResult<EventSender> {
        self.lock_running()
            .as_ref()
            .map(|running| EventSender {
                tx: running.events.clone(),
            })
            .ok_or(GattError::NotStarted)
    }

    /// Send a notification to one session
    pub fn notify(&self, session: SessionId, handle: u16, value: &[u8]) -> GattResult<()> {
        self.engine
            .send_value(session, handle, value, OutboundKind::Notification)
    }

    /// Send an indication to one session
    pub fn indicate(&self, session: SessionId, handle: u16, value: &[u8]) -> GattResult<()> {
        self.engine
            .send_value(session, handle, value, OutboundKind::Indication)
    }

    /// Notify every session subscribed to `handle`. Returns how many were reached.
    pub fn notify_subscribers(&self, handle: u16, value: &[u8]) -> usize {
        let mut reached = 0;
        for session in self.engine.sessions.sessions() {
            match self
                .engine
                .send_value(session.id(), handle, value, OutboundKind::Notification)
            {
                Ok(()) => reached += 1,
                Err(GattError::NotSubscribed(_)) => {}
                Err(err) => debug!("{}: notification skipped: {}", session.id(), err),
            }
        }
        reached
    }

    /// Replace the stored value of a characteristic
    pub fn set_value(&self, handle: u16, value: &[u8]) -> GattResult<()> {
        self.engine.registry.set_value(handle, value)
    }

    /// Stored value of a characteristic
    pub fn value(&self, handle: u16) -> GattResult<Arc<[u8]>> {
        self.engine.registry.current_value(handle)
    }

    /// Disconnect a peer from the server side
    pub fn disconnect(&self, session: SessionId) -> bool {
        self.engine.close_session(session, CloseReason::LocalDisconnect)
    }

    /// State of a session; unknown sessions report `Closed`
    pub fn session_state(&self, session: SessionId) -> SessionState {
        self.engine.sessions.state(session)
    }

    /// Negotiated MTU of an open session
    pub fn session_mtu(&self, session: SessionId) -> Option<u16> {
        self.engine.sessions.get(session).ok().map(|s| s.mtu())
    }

    /// Ids of the open sessions
    pub fn sessions(&self) -> Vec<SessionId> {
        self.engine
            .sessions
            .sessions()
            .iter()
            .map(|session| session.id())
            .collect()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for GattServer {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

impl Engine {
    fn route(self: Arc<Self>, rx: Receiver<RouterEvent>) {
        debug!("Router started");
        while let Ok(event) = rx.recv() {
            match event {
                RouterEvent::Transport(event) => self.handle_transport_event(event),
                RouterEvent::Shutdown => break,
            }
        }
        debug!("Router stopped");
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected(id) => {
                self.open_session(id);
            }
            TransportEvent::BytesReceived(id, pdu) => {
                let session = match self.sessions.get(id) {
                    Ok(session) => session,
                    Err(_) => match self.open_session(id) {
                        Some(session) => session,
                        None => return,
                    },
                };
                if !session.post(SessionEvent::Pdu(pdu)) {
                    warn!("{}: worker gone, dropping PDU", id);
                }
            }
            TransportEvent::Disconnected(id) => {
                self.close_session(id, CloseReason::PeerDisconnected);
            }
            TransportEvent::SendBufferDrained(id) => {
                if let Ok(session) = self.sessions.get(id) {
                    session.post(SessionEvent::Drained);
                }
            }
        }
    }

    fn open_session(self: &Arc<Self>, id: SessionId) -> Option<Arc<Session>> {
        let session = match self.sessions.connect(id) {
            Ok((session, false)) => return Some(session),
            Ok((session, true)) => session,
            Err(err) => {
                warn!("{}: {}", id, err);
                self.transport.disconnect(id);
                return None;
            }
        };

        let (tx, rx) = mpsc::channel();
        session.attach_worker(tx);
        let engine = Arc::clone(self);
        let worker = Arc::clone(&session);
        if let Err(err) = thread::Builder::new()
            .name(format!("gatt-{}", id))
            .spawn(move || engine.run_worker(worker, rx))
        {
            error!("{}: failed to spawn worker: {}", id, err);
            self.close_session(id, CloseReason::Internal);
            return None;
        }

        self.app
            .on_session_state_changed(id, SessionState::Connecting);
        Some(session)
    }

    fn run_worker(&self, session: Arc<Session>, rx: Receiver<SessionEvent>) {
        let id = session.id();
        debug!("{}: worker started", id);

        loop {
            let event = match session.indication_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            "{}: indication not confirmed within {:?}",
                            id, self.config.indication_timeout
                        );
                        self.close_session(id, CloseReason::IndicationTimeout);
                        break;
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                SessionEvent::Pdu(pdu) => self.handle_pdu(&session, &pdu),
                SessionEvent::Drained => {
                    session.resume_queue();
                    self.pump(&session);
                }
                SessionEvent::Wake => {}
                SessionEvent::Shutdown => break,
            }

            if !session.state().is_open() {
                break;
            }
        }
        debug!("{}: worker stopped", id);
    }

    fn handle_pdu(&self, session: &Arc<Session>, pdu: &[u8]) {
        let id = session.id();
        trace!("{} <- {}", id, hex::encode(pdu));

        let outcome = self.dispatcher.dispatch(session, pdu);
        if let Some(response) = outcome.response {
            let sent = match self.send_response(session, &response) {
                Err(GattError::Encode(err)) => {
                    error!("{}: failed to encode response: {}", id, err);
                    let opcode = pdu.first().copied().unwrap_or_default();
                    let fallback = Response::error(opcode, 0, AttErrorCode::Unlikely);
                    self.send_response(session, &fallback)
                }
                other => other,
            };
            if let Err(err) = sent {
                warn!("{}: failed to send response: {}", id, err);
                self.close_session(id, CloseReason::TransportFailure);
                return;
            }
        }

        if let Some(err) = outcome.fatal {
            warn!("{}: closing after {}", id, err);
            self.close_session(id, close_reason(&err));
        }
    }

    fn send_response(&self, session: &Session, response: &Response) -> GattResult<()> {
        let bytes = att::encode(response, session.mtu()).map_err(GattError::Encode)?;
        trace!("{} -> {}", session.id(), hex::encode(&bytes));
        self.transport.send(session.id(), &bytes)?;
        Ok(())
    }

    fn pump(&self, session: &Session) {
        match session.pump(self.transport.as_ref(), self.config.indication_timeout) {
            Ok(_) | Err(GattError::SessionClosed) => {}
            Err(err) => {
                warn!("{}: outbound queue failed: {}", session.id(), err);
                self.close_session(session.id(), CloseReason::TransportFailure);
            }
        }
    }

    fn send_value(
        &self,
        id: SessionId,
        handle: u16,
        value: &[u8],
        kind: OutboundKind,
    ) -> GattResult<()> {
        let session = self.sessions.get(id)?;
        let entry = self.registry.lookup(handle)?;
        if entry.value_handle != handle {
            return Err(GattError::NotFound(handle));
        }
        let required = match kind {
            OutboundKind::Notification => CharacteristicProperties::NOTIFY,
            OutboundKind::Indication => CharacteristicProperties::INDICATE,
        };
        if !entry.properties.contains(required) {
            return Err(GattError::PermissionDenied);
        }

        session.enqueue_value(handle, value, kind)?;
        match session.pump(self.transport.as_ref(), self.config.indication_timeout) {
            Ok(report) => {
                if report.indication_sent {
                    // Re-arm the worker's wait on the new deadline
                    session.post(SessionEvent::Wake);
                }
                Ok(())
            }
            Err(GattError::SessionClosed) => Err(GattError::SessionClosed),
            Err(err) => {
                self.close_session(id, CloseReason::TransportFailure);
                Err(err)
            }
        }
    }

    fn close_session(&self, id: SessionId, reason: CloseReason) -> bool {
        if !self.sessions.close(id, reason) {
            return false;
        }
        if reason != CloseReason::PeerDisconnected {
            self.transport.disconnect(id);
        }
        self.app.on_session_state_changed(id, SessionState::Closed);
        true
    }
}

fn close_reason(err: &GattError) -> CloseReason {
    match err {
        GattError::IndicationTimeout => CloseReason::IndicationTimeout,
        GattError::ResponseTimeout => CloseReason::ResponseTimeout,
        GattError::Transport(_) => CloseReason::TransportFailure,
        _ => CloseReason::ProtocolError,
    }
}
