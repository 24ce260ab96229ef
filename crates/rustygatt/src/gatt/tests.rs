//! Unit tests for GATT functionality

use super::*;
use crate::att::*;
use crate::config::ServerConfig;
use crate::error::GattError;
use crate::gap::{AdvertiseOptions, Advertiser, AdvertisingData, AdvertisingError};
use crate::transport::{SendError, SessionId, Transport, TransportEvent};
use crate::uuid::Uuid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const RW_VALUE: u16 = 3;
const RO_VALUE: u16 = 5;
const STREAM_VALUE: u16 = 7;
const STREAM_CCCD: u16 = 8;
const COMMAND_VALUE: u16 = 10;
const SECURE_VALUE: u16 = 12;

/// Mock transport recording every PDU the server sends
struct MockTransport {
    sent: Mutex<Sender<(SessionId, Vec<u8>)>>,
    disconnects: Mutex<Vec<SessionId>>,
    blocked: AtomicBool,
    encrypted: AtomicBool,
}

impl MockTransport {
    fn new() -> (Arc<Self>, Receiver<(SessionId, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let transport = Arc::new(Self {
            sent: Mutex::new(tx),
            disconnects: Mutex::new(Vec::new()),
            blocked: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
        });
        (transport, rx)
    }

    fn disconnected(&self, session: SessionId) -> bool {
        self.disconnects.lock().unwrap().contains(&session)
    }
}

impl Transport for MockTransport {
    fn send(&self, session: SessionId, pdu: &[u8]) -> Result<(), SendError> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(SendError::WouldBlock);
        }
        let _ = self.sent.lock().unwrap().send((session, pdu.to_vec()));
        Ok(())
    }

    fn disconnect(&self, session: SessionId) {
        self.disconnects.lock().unwrap().push(session);
    }

    fn is_encrypted(&self, _session: SessionId) -> bool {
        self.encrypted.load(Ordering::SeqCst)
    }
}

/// Application recording callbacks, with an optional stall in `on_write`
#[derive(Default)]
struct RecordingApp {
    states: Mutex<Vec<(SessionId, SessionState)>>,
    writes: Mutex<Vec<(u16, Vec<u8>)>>,
    write_stall: Mutex<Option<Duration>>,
    reject: Mutex<Option<u8>>,
}

impl RecordingApp {
    fn stall_writes(&self, duration: Duration) {
        *self.write_stall.lock().unwrap() = Some(duration);
    }

    fn states_of(&self, session: SessionId) -> Vec<SessionState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl GattApplication for RecordingApp {
    fn on_write(&self, _session: SessionId, handle: u16, _offset: u16, value: &[u8]) -> WriteOutcome {
        let stall = *self.write_stall.lock().unwrap();
        if let Some(stall) = stall {
            thread::sleep(stall);
        }
        self.writes.lock().unwrap().push((handle, value.to_vec()));
        match *self.reject.lock().unwrap() {
            Some(code) => WriteOutcome::Reject(code),
            None => WriteOutcome::Accept,
        }
    }

    fn on_session_state_changed(&self, session: SessionId, state: SessionState) {
        self.states.lock().unwrap().push((session, state));
    }
}

struct NullAdvertiser;

impl Advertiser for NullAdvertiser {
    fn start_advertising(
        &mut self,
        _data: &AdvertisingData,
        _options: &AdvertiseOptions,
    ) -> Result<(), AdvertisingError> {
        Ok(())
    }

    fn stop_advertising(&mut self) {}
}

/// Scripted central talking to the server through the mock transport
struct Peer {
    id: SessionId,
    events: EventSender,
}

impl Peer {
    fn connect(server: &GattServer, id: u64) -> Self {
        let peer = Self {
            id: SessionId(id),
            events: server.event_sender().unwrap(),
        };
        peer.events
            .send(TransportEvent::Connected(peer.id))
            .unwrap();
        peer
    }

    fn send(&self, request: ParsedRequest) {
        self.events
            .send(TransportEvent::BytesReceived(self.id, request.encode()))
            .unwrap();
    }

    fn send_raw(&self, pdu: &[u8]) {
        self.events
            .send(TransportEvent::BytesReceived(self.id, pdu.to_vec()))
            .unwrap();
    }

    fn disconnect(&self) {
        self.events
            .send(TransportEvent::Disconnected(self.id))
            .unwrap();
    }
}

struct Harness {
    server: Arc<GattServer>,
    transport: Arc<MockTransport>,
    app: Arc<RecordingApp>,
    rx: Receiver<(SessionId, Vec<u8>)>,
}

impl Harness {
    fn start(config: ServerConfig) -> Self {
        let (transport, rx) = MockTransport::new();
        let app = Arc::new(RecordingApp::default());
        let server = GattServer::new(config, transport.clone(), app.clone()).unwrap();
        server.register_service(test_service()).unwrap();
        server.start(Box::new(NullAdvertiser)).unwrap();
        Self {
            server: Arc::new(server),
            transport,
            app,
            rx,
        }
    }

    /// Next PDU sent to `peer`, decoded
    fn recv(&self, peer: &Peer) -> Response {
        let (id, pdu) = self.rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, peer.id);
        Response::decode(&pdu).unwrap()
    }

    fn request(&self, peer: &Peer, request: ParsedRequest) -> Response {
        peer.send(request);
        self.recv(peer)
    }

    fn expect_silence(&self, wait: Duration) {
        assert!(self.rx.recv_timeout(wait).is_err());
    }

    fn subscribe(&self, peer: &Peer, bits: u16) {
        let response = self.request(
            peer,
            write(STREAM_CCCD, 0, &bits.to_le_bytes(), WriteKind::Request),
        );
        assert_eq!(response, Response::Write);
    }
}

fn test_service() -> Service {
    Service::primary(Uuid::from_u16(0x2222))
        .with_characteristic(
            Characteristic::new(
                Uuid::from_u16(0x1111),
                CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                Permissions::READ | Permissions::WRITE,
            )
            .with_value(b"hello".to_vec()),
        )
        .with_characteristic(
            Characteristic::new(
                Uuid::from_u16(0x1112),
                CharacteristicProperties::READ,
                Permissions::READ,
            )
            .with_value(b"ro".to_vec()),
        )
        .with_characteristic(Characteristic::new(
            Uuid::from_u16(0x1113),
            CharacteristicProperties::READ
                | CharacteristicProperties::NOTIFY
                | CharacteristicProperties::INDICATE,
            Permissions::READ,
        ))
        .with_characteristic(Characteristic::new(
            Uuid::from_u16(0x1114),
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            Permissions::WRITE,
        ))
        .with_characteristic(
            Characteristic::new(
                Uuid::from_u16(0x1115),
                CharacteristicProperties::READ,
                Permissions::READ_ENCRYPTED,
            )
            .with_value(b"secret".to_vec()),
        )
}

fn write(handle: u16, offset: u16, value: &[u8], kind: WriteKind) -> ParsedRequest {
    ParsedRequest::Write {
        handle,
        offset,
        value: value.to_vec(),
        kind,
    }
}

fn read(handle: u16) -> ParsedRequest {
    ParsedRequest::Read { handle }
}

fn read_blob(handle: u16, offset: u16) -> ParsedRequest {
    ParsedRequest::ReadBlob { handle, offset }
}

fn error(opcode: u8, handle: u16, code: AttErrorCode) -> Response {
    Response::error(opcode, handle, code)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_registered_handle_layout() {
    let (transport, _rx) = MockTransport::new();
    let server = GattServer::new(
        ServerConfig::default(),
        transport,
        Arc::new(NoopApplication),
    )
    .unwrap();
    let handles = server.register_service(test_service()).unwrap();

    assert_eq!(handles.service_handle, 1);
    assert_eq!(handles.end_handle, SECURE_VALUE);
    assert_eq!(handles.value_handle(Uuid::from_u16(0x1111)), Some(RW_VALUE));
    assert_eq!(handles.characteristics[2].value_handle, STREAM_VALUE);
    assert_eq!(handles.characteristics[2].cccd_handle, Some(STREAM_CCCD));
    assert_eq!(handles.characteristics[3].value_handle, COMMAND_VALUE);
    assert_eq!(&*server.value(RW_VALUE).unwrap(), b"hello");
}

#[test]
fn test_start_and_stop() {
    let (transport, _rx) = MockTransport::new();
    let server = GattServer::new(
        ServerConfig::default(),
        transport,
        Arc::new(NoopApplication),
    )
    .unwrap();
    assert!(matches!(server.event_sender(), Err(GattError::NotStarted)));
    assert_eq!(server.stop(), Err(GattError::NotStarted));

    server.register_service(test_service()).unwrap();
    server.start(Box::new(NullAdvertiser)).unwrap();
    assert!(server.is_running());
    assert_eq!(
        server.start(Box::new(NullAdvertiser)),
        Err(GattError::AlreadyStarted)
    );
    assert_eq!(
        server.register_service(test_service()).unwrap_err(),
        GattError::AlreadyStarted
    );

    let peer = Peer::connect(&server, 1);
    assert!(wait_until(|| server.session_state(peer.id) == SessionState::Connecting));

    server.stop().unwrap();
    assert!(!server.is_running());
    assert_eq!(server.session_state(peer.id), SessionState::Closed);

    // Registry accepts services again once stopped
    assert!(server.register_service(test_service()).is_ok());
}

#[test]
fn test_start_rolls_back_when_advertising_fails() {
    struct FailingAdvertiser;
    impl Advertiser for FailingAdvertiser {
        fn start_advertising(
            &mut self,
            _data: &AdvertisingData,
            _options: &AdvertiseOptions,
        ) -> Result<(), AdvertisingError> {
            Err(AdvertisingError::TooManyAdvertisers)
        }
        fn stop_advertising(&mut self) {}
    }

    let (transport, _rx) = MockTransport::new();
    let server = GattServer::new(
        ServerConfig::default(),
        transport,
        Arc::new(NoopApplication),
    )
    .unwrap();
    assert_eq!(
        server.start(Box::new(FailingAdvertiser)),
        Err(GattError::Advertising(AdvertisingError::TooManyAdvertisers))
    );
    assert!(!server.is_running());
    assert!(server.register_service(test_service()).is_ok());
}

#[test]
fn test_start_rejects_oversized_device_name() {
    let (transport, _rx) = MockTransport::new();
    let server = GattServer::new(
        ServerConfig {
            device_name: "n".repeat(255),
            ..Default::default()
        },
        transport,
        Arc::new(RecordingApp::default()),
    )
    .unwrap();
    server.register_service(test_service()).unwrap();

    assert!(matches!(
        server.start(Box::new(NullAdvertiser)),
        Err(GattError::Advertising(AdvertisingError::DataTooLarge(_)))
    ));
    assert!(!server.is_running());
}

#[test]
fn test_mtu_exchange_clamped_and_fixed() {
    let h = Harness::start(ServerConfig {
        max_mtu: 185,
        ..Default::default()
    });

    let small = Peer::connect(&h.server, 1);
    let response = h.request(&small, ParsedRequest::ExchangeMtu { client_mtu: 10 });
    assert_eq!(
        response,
        Response::ExchangeMtu(ExchangeMtuResponse {
            server_mtu: ATT_DEFAULT_MTU
        })
    );
    assert_eq!(h.server.session_mtu(small.id), Some(ATT_DEFAULT_MTU));
    assert_eq!(h.server.session_state(small.id), SessionState::Ready);

    let large = Peer::connect(&h.server, 2);
    let response = h.request(&large, ParsedRequest::ExchangeMtu { client_mtu: 517 });
    assert_eq!(
        response,
        Response::ExchangeMtu(ExchangeMtuResponse { server_mtu: 185 })
    );
    assert_eq!(h.server.session_mtu(large.id), Some(185));

    let middle = Peer::connect(&h.server, 3);
    let response = h.request(&middle, ParsedRequest::ExchangeMtu { client_mtu: 100 });
    assert_eq!(
        response,
        Response::ExchangeMtu(ExchangeMtuResponse { server_mtu: 100 })
    );
    assert_eq!(h.server.session_mtu(middle.id), Some(100));

    // A second exchange does not move the MTU
    let response = h.request(&large, ParsedRequest::ExchangeMtu { client_mtu: 50 });
    assert_eq!(
        response,
        Response::ExchangeMtu(ExchangeMtuResponse { server_mtu: 185 })
    );
    assert_eq!(h.server.session_mtu(large.id), Some(185));
    assert_eq!(
        h.app.states_of(large.id),
        vec![SessionState::Connecting, SessionState::Ready]
    );
}

#[test]
fn test_long_write_commits_at_execute() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    let response = h.request(&peer, write(RW_VALUE, 0, b"AB", WriteKind::Prepare));
    assert_eq!(
        response,
        Response::PrepareWrite(PrepareWriteResponse {
            handle: RW_VALUE,
            offset: 0,
            value: b"AB".to_vec(),
        })
    );
    h.request(&peer, write(RW_VALUE, 2, b"CD", WriteKind::Prepare));

    // Nothing is visible before the execute
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), b"hello");

    let response = h.request(
        &peer,
        ParsedRequest::ExecuteWrite {
            flag: ExecuteFlag::Commit,
        },
    );
    assert_eq!(response, Response::ExecuteWrite);
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), b"ABCD");
    assert_eq!(
        *h.app.writes.lock().unwrap(),
        vec![(RW_VALUE, b"ABCD".to_vec())]
    );

    // Cancel discards the buffer
    h.request(&peer, write(RW_VALUE, 0, b"XY", WriteKind::Prepare));
    let response = h.request(
        &peer,
        ParsedRequest::ExecuteWrite {
            flag: ExecuteFlag::Cancel,
        },
    );
    assert_eq!(response, Response::ExecuteWrite);
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), b"ABCD");
    assert_eq!(h.app.writes.lock().unwrap().len(), 1);
}

#[test]
fn test_prepare_write_out_of_order_keeps_buffer() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    h.request(&peer, write(RW_VALUE, 0, b"AB", WriteKind::Prepare));
    let response = h.request(&peer, write(RW_VALUE, 5, b"CD", WriteKind::Prepare));
    assert_eq!(
        response,
        error(ATT_PREPARE_WRITE_REQ, RW_VALUE, AttErrorCode::InvalidOffset)
    );

    // The buffered "AB" survived the bad fragment
    h.request(&peer, write(RW_VALUE, 2, b"CD", WriteKind::Prepare));
    h.request(
        &peer,
        ParsedRequest::ExecuteWrite {
            flag: ExecuteFlag::Commit,
        },
    );
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), b"ABCD");
}

#[test]
fn test_execute_write_rejected_by_application() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    *h.app.reject.lock().unwrap() = Some(0x80);

    h.request(&peer, write(RW_VALUE, 0, b"AB", WriteKind::Prepare));
    let response = h.request(
        &peer,
        ParsedRequest::ExecuteWrite {
            flag: ExecuteFlag::Commit,
        },
    );
    assert_eq!(
        response,
        error(
            ATT_EXECUTE_WRITE_REQ,
            RW_VALUE,
            AttErrorCode::ApplicationError(0x80)
        )
    );
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), b"hello");
}

#[test]
fn test_write_to_read_only_characteristic() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    let response = h.request(&peer, write(RO_VALUE, 0, b"x", WriteKind::Request));
    assert_eq!(
        response,
        error(ATT_WRITE_REQ, RO_VALUE, AttErrorCode::WriteNotPermitted)
    );
    assert_eq!(&*h.server.value(RO_VALUE).unwrap(), b"ro");
    assert!(h.app.writes.lock().unwrap().is_empty());
}

#[test]
fn test_write_command_gets_no_response() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    peer.send(write(COMMAND_VALUE, 0, b"go", WriteKind::Command));
    // The next PDU out answers the read, not the command
    let response = h.request(&peer, read(RO_VALUE));
    assert_eq!(
        response,
        Response::Read(ReadResponse {
            value: b"ro".to_vec()
        })
    );
    assert_eq!(&*h.server.value(COMMAND_VALUE).unwrap(), b"go");
}

#[test]
fn test_long_read_serves_snapshot() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    let long: Vec<u8> = (0..30).collect();
    h.server.set_value(RW_VALUE, &long).unwrap();

    let first = h.request(&peer, read(RW_VALUE));
    assert_eq!(
        first,
        Response::Read(ReadResponse {
            value: long[..22].to_vec()
        })
    );

    // A concurrent update does not tear the long read
    h.server.set_value(RW_VALUE, b"changed").unwrap();
    let rest = h.request(&peer, read_blob(RW_VALUE, 22));
    assert_eq!(
        rest,
        Response::ReadBlob(ReadBlobResponse {
            value: long[22..].to_vec()
        })
    );

    // The next read starts over from the current value
    let fresh = h.request(&peer, read(RW_VALUE));
    assert_eq!(
        fresh,
        Response::Read(ReadResponse {
            value: b"changed".to_vec()
        })
    );
}

#[test]
fn test_read_past_end_of_empty_value() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    h.server.set_value(RW_VALUE, b"").unwrap();

    let response = h.request(&peer, read(RW_VALUE));
    assert_eq!(response, Response::Read(ReadResponse { value: Vec::new() }));
    let response = h.request(&peer, read_blob(RW_VALUE, 5));
    assert_eq!(
        response,
        Response::ReadBlob(ReadBlobResponse { value: Vec::new() })
    );
}

#[test]
fn test_read_blob_at_offset_zero() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    let response = h.request(&peer, read_blob(RW_VALUE, 0));
    assert_eq!(
        response,
        Response::ReadBlob(ReadBlobResponse {
            value: b"hello".to_vec()
        })
    );

    // Errors echo the Read Blob opcode
    let response = h.request(&peer, read_blob(SECURE_VALUE, 0));
    assert_eq!(
        response,
        error(
            ATT_READ_BLOB_REQ,
            SECURE_VALUE,
            AttErrorCode::InsufficientEncryption
        )
    );
}

#[test]
fn test_encrypted_read_requires_encrypted_link() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    let response = h.request(&peer, read(SECURE_VALUE));
    assert_eq!(
        response,
        error(
            ATT_READ_REQ,
            SECURE_VALUE,
            AttErrorCode::InsufficientEncryption
        )
    );

    h.transport.encrypted.store(true, Ordering::SeqCst);
    let response = h.request(&peer, read(SECURE_VALUE));
    assert_eq!(
        response,
        Response::Read(ReadResponse {
            value: b"secret".to_vec()
        })
    );
}

#[test]
fn test_discovery() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    let response = h.request(
        &peer,
        ParsedRequest::ReadByGroupType {
            start_handle: 0x0001,
            end_handle: 0xFFFF,
            group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
        },
    );
    assert_eq!(
        response,
        Response::ReadByGroupType(ReadByGroupTypeResponse {
            length: 6,
            data: vec![AttributeData {
                handle: 1,
                end_group_handle: SECURE_VALUE,
                value: vec![0x22, 0x22],
            }],
        })
    );

    let response = h.request(
        &peer,
        ParsedRequest::ReadByGroupType {
            start_handle: SECURE_VALUE + 1,
            end_handle: 0xFFFF,
            group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
        },
    );
    assert_eq!(
        response,
        error(
            ATT_READ_BY_GROUP_TYPE_REQ,
            SECURE_VALUE + 1,
            AttErrorCode::AttributeNotFound
        )
    );

    // Declarations are 7 bytes each; three fit the default MTU
    let response = h.request(
        &peer,
        ParsedRequest::ReadByType {
            start_handle: 0x0001,
            end_handle: 0xFFFF,
            attribute_type: Uuid::from_u16(CHARACTERISTIC_UUID),
        },
    );
    let Response::ReadByType(by_type) = response else {
        panic!("expected a Read By Type response");
    };
    assert_eq!(by_type.length, 7);
    let handles: Vec<u16> = by_type.data.iter().map(|d| d.handle).collect();
    assert_eq!(handles, vec![2, 4, 6]);
    assert_eq!(by_type.data[0].value, vec![0x0A, 0x03, 0x00, 0x11, 0x11]);

    let response = h.request(
        &peer,
        ParsedRequest::FindInformation {
            start_handle: 1,
            end_handle: 3,
        },
    );
    assert_eq!(
        response,
        Response::FindInformation(FindInformationResponse {
            entries: vec![
                (1, Uuid::from_u16(PRIMARY_SERVICE_UUID)),
                (2, Uuid::from_u16(CHARACTERISTIC_UUID)),
                (3, Uuid::from_u16(0x1111)),
            ],
        })
    );
}

#[test]
fn test_notify_requires_subscription() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    h.request(&peer, ParsedRequest::ExchangeMtu { client_mtu: 23 });

    assert_eq!(
        h.server.notify(peer.id, STREAM_VALUE, b"x"),
        Err(GattError::NotSubscribed(STREAM_VALUE))
    );
    assert_eq!(
        h.server.notify(peer.id, RW_VALUE, b"x"),
        Err(GattError::PermissionDenied)
    );

    h.subscribe(&peer, CCCD_NOTIFY);
    let cccd = h.request(&peer, read(STREAM_CCCD));
    assert_eq!(
        cccd,
        Response::Read(ReadResponse {
            value: vec![0x01, 0x00]
        })
    );

    assert_eq!(h.server.notify_subscribers(STREAM_VALUE, b"n"), 1);
    assert_eq!(
        h.recv(&peer),
        Response::Notification(HandleValueNotification {
            handle: STREAM_VALUE,
            value: b"n".to_vec(),
        })
    );
}

#[test]
fn test_notifications_resume_after_drain() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    h.subscribe(&peer, CCCD_NOTIFY);

    h.transport.blocked.store(true, Ordering::SeqCst);
    h.server.notify(peer.id, STREAM_VALUE, b"1").unwrap();
    h.server.notify(peer.id, STREAM_VALUE, b"2").unwrap();
    h.expect_silence(Duration::from_millis(50));

    h.transport.blocked.store(false, Ordering::SeqCst);
    peer.events
        .send(TransportEvent::SendBufferDrained(peer.id))
        .unwrap();
    for expected in [b"1", b"2"] {
        assert_eq!(
            h.recv(&peer),
            Response::Notification(HandleValueNotification {
                handle: STREAM_VALUE,
                value: expected.to_vec(),
            })
        );
    }
}

#[test]
fn test_one_indication_outstanding() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    h.subscribe(&peer, CCCD_INDICATE);

    let senders: Vec<_> = (0..4u8)
        .map(|i| {
            let server = Arc::clone(&h.server);
            let id = peer.id;
            thread::spawn(move || server.indicate(id, STREAM_VALUE, &[i]))
        })
        .collect();
    for sender in senders {
        sender.join().unwrap().unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..4 {
        let Response::Indication(indication) = h.recv(&peer) else {
            panic!("expected an indication");
        };
        assert!(seen.insert(indication.value[0]));
        // Nothing else goes out until the confirmation
        h.expect_silence(Duration::from_millis(50));
        peer.send(ParsedRequest::Confirmation);
    }
    assert_eq!(seen, (0..4u8).collect::<HashSet<_>>());
}

#[test]
fn test_indication_timeout_closes_session() {
    let h = Harness::start(ServerConfig {
        indication_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let peer = Peer::connect(&h.server, 1);
    h.subscribe(&peer, CCCD_INDICATE);

    h.server.indicate(peer.id, STREAM_VALUE, b"!").unwrap();
    assert!(matches!(h.recv(&peer), Response::Indication(_)));

    assert!(wait_until(|| h.server.session_state(peer.id) == SessionState::Closed));
    assert!(wait_until(|| h.transport.disconnected(peer.id)));
    assert_eq!(
        h.server.indicate(peer.id, STREAM_VALUE, b"!"),
        Err(GattError::SessionClosed)
    );
}

#[test]
fn test_disconnect_during_write_callback() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    h.app.stall_writes(Duration::from_millis(300));

    peer.send(write(RW_VALUE, 0, b"late", WriteKind::Request));
    thread::sleep(Duration::from_millis(50));
    peer.disconnect();

    assert!(wait_until(|| h.server.session_state(peer.id) == SessionState::Closed));
    // Let the callback finish; its result has nowhere to go
    assert!(wait_until(|| !h.app.writes.lock().unwrap().is_empty()));
    h.expect_silence(Duration::from_millis(100));

    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), b"hello");
    let closed = h
        .app
        .states_of(peer.id)
        .into_iter()
        .filter(|state| *state == SessionState::Closed)
        .count();
    assert_eq!(closed, 1);
    // Peer-initiated close does not bounce a disconnect back
    assert!(!h.transport.disconnected(peer.id));
}

#[test]
fn test_response_timeout_closes_only_that_session() {
    let h = Harness::start(ServerConfig {
        response_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let slow = Peer::connect(&h.server, 1);
    let other = Peer::connect(&h.server, 2);
    h.app.stall_writes(Duration::from_millis(500));

    let response = h.request(&slow, write(RW_VALUE, 0, b"x", WriteKind::Request));
    assert_eq!(
        response,
        error(ATT_WRITE_REQ, RW_VALUE, AttErrorCode::Unlikely)
    );
    assert!(wait_until(|| h.transport.disconnected(slow.id)));
    assert_eq!(h.server.session_state(slow.id), SessionState::Closed);

    let response = h.request(&other, read(RO_VALUE));
    assert_eq!(
        response,
        Response::Read(ReadResponse {
            value: b"ro".to_vec()
        })
    );
    assert_eq!(h.server.session_state(other.id), SessionState::Ready);
}

#[test]
fn test_unknown_request_closes_session() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    // Unknown commands are dropped silently
    peer.send_raw(&[0x7F, 0x00]);
    let response = h.request(&peer, read(RO_VALUE));
    assert!(matches!(response, Response::Read(_)));

    peer.send_raw(&[0x3F, 0x00]);
    assert_eq!(
        h.recv(&peer),
        error(0x3F, 0, AttErrorCode::RequestNotSupported)
    );
    assert!(wait_until(|| h.transport.disconnected(peer.id)));
    assert_eq!(h.server.session_state(peer.id), SessionState::Closed);
}

#[test]
fn test_pdu_longer_than_mtu_closes_session() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);

    // A PDU filling the default MTU exactly is served
    let fits = h.request(&peer, write(RW_VALUE, 0, &[0xAB; 20], WriteKind::Request));
    assert_eq!(fits, Response::Write);
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), &[0xAB; 20][..]);

    let mut pdu = vec![ATT_WRITE_REQ, RW_VALUE as u8, 0x00];
    pdu.extend_from_slice(&[0xCD; 597]);
    peer.send_raw(&pdu);
    assert_eq!(
        h.recv(&peer),
        error(ATT_WRITE_REQ, 0, AttErrorCode::InvalidPdu)
    );
    assert!(wait_until(|| h.transport.disconnected(peer.id)));
    assert_eq!(h.server.session_state(peer.id), SessionState::Closed);
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), &[0xAB; 20][..]);
}

#[test]
fn test_negotiated_mtu_bounds_inbound_pdus() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    h.request(&peer, ParsedRequest::ExchangeMtu { client_mtu: 100 });

    let fits = h.request(&peer, write(RW_VALUE, 0, &[0x11; 97], WriteKind::Request));
    assert_eq!(fits, Response::Write);

    let too_long = h.request(&peer, write(RW_VALUE, 0, &[0x22; 98], WriteKind::Request));
    assert_eq!(too_long, error(ATT_WRITE_REQ, 0, AttErrorCode::InvalidPdu));
    assert!(wait_until(|| h.transport.disconnected(peer.id)));
    assert_eq!(&*h.server.value(RW_VALUE).unwrap(), &[0x11; 97][..]);
}

#[test]
fn test_session_limit_rejects_extra_peer() {
    let h = Harness::start(ServerConfig {
        max_concurrent_sessions: 1,
        ..Default::default()
    });
    let first = Peer::connect(&h.server, 1);
    let second = Peer::connect(&h.server, 2);

    assert!(wait_until(|| h.transport.disconnected(second.id)));
    assert_eq!(h.server.session_state(second.id), SessionState::Closed);
    assert_eq!(h.server.sessions(), vec![first.id]);
}

#[test]
fn test_application_disconnect() {
    let h = Harness::start(ServerConfig::default());
    let peer = Peer::connect(&h.server, 1);
    assert!(wait_until(|| h.server.session_state(peer.id) == SessionState::Connecting));

    assert!(h.server.disconnect(peer.id));
    assert!(!h.server.disconnect(peer.id));
    assert!(h.transport.disconnected(peer.id));
    assert_eq!(h.server.session_mtu(peer.id), None);
}
