//! Example demonstrating a simple GATT server
//!
//! This example hosts a "log" service: every write is appended to a bounded
//! log, and reading the characteristic returns the log. A loopback transport
//! plays the part of a connected central so the example runs without a radio.

use rustygatt::att::{ExecuteFlag, ParsedRequest, Response, WriteKind};
use rustygatt::gap::{AdvertiseOptions, Advertiser, AdvertisingData, AdvertisingError};
use rustygatt::gatt::{
    Characteristic, CharacteristicProperties, GattApplication, GattServer, Permissions, Service,
    SessionState, WriteOutcome,
};
use rustygatt::{SendError, ServerConfig, SessionId, Transport, TransportEvent, Uuid};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LOG_LIMIT: usize = 64;

/// Delivers server PDUs to the in-process central
struct LoopbackTransport {
    outbound: Mutex<Sender<Vec<u8>>>,
}

impl Transport for LoopbackTransport {
    fn send(&self, _session: SessionId, pdu: &[u8]) -> Result<(), SendError> {
        self.outbound
            .lock()
            .unwrap()
            .send(pdu.to_vec())
            .map_err(|_| SendError::Disconnected)
    }

    fn disconnect(&self, session: SessionId) {
        println!("Transport: dropping {}", session);
    }
}

struct PrintingAdvertiser;

impl Advertiser for PrintingAdvertiser {
    fn start_advertising(
        &mut self,
        data: &AdvertisingData,
        options: &AdvertiseOptions,
    ) -> Result<(), AdvertisingError> {
        println!(
            "Advertising {:?} every {} slots: {:02x?}",
            data.local_name,
            options.mode.interval(),
            data.to_bytes()?
        );
        Ok(())
    }

    fn stop_advertising(&mut self) {
        println!("Advertising stopped");
    }
}

/// Keeps the last `LOG_LIMIT` bytes written by any client
#[derive(Default)]
struct LogApp {
    log: Mutex<Vec<u8>>,
}

impl GattApplication for LogApp {
    fn on_write(&self, session: SessionId, handle: u16, _offset: u16, value: &[u8]) -> WriteOutcome {
        println!("{} wrote {:?} to {:#06x}", session, String::from_utf8_lossy(value), handle);
        let mut log = self.log.lock().unwrap();
        log.extend_from_slice(value);
        log.push(b'\n');
        if log.len() > LOG_LIMIT {
            let excess = log.len() - LOG_LIMIT;
            log.drain(..excess);
        }
        WriteOutcome::Accept
    }

    fn on_read(&self, _session: SessionId, _handle: u16, _offset: u16) -> Option<Vec<u8>> {
        Some(self.log.lock().unwrap().clone())
    }

    fn on_session_state_changed(&self, session: SessionId, state: SessionState) {
        println!("{} is now {:?}", session, state);
    }

    fn on_mtu_changed(&self, session: SessionId, mtu: u16) {
        println!("{} negotiated MTU {}", session, mtu);
    }
}

fn exchange(
    events: &rustygatt::gatt::EventSender,
    replies: &Receiver<Vec<u8>>,
    session: SessionId,
    request: ParsedRequest,
) -> Result<Response, Box<dyn std::error::Error>> {
    events.send(TransportEvent::BytesReceived(session, request.encode()))?;
    let pdu = replies.recv_timeout(Duration::from_secs(5))?;
    Ok(Response::decode(&pdu)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (tx, replies) = mpsc::channel();
    let transport = Arc::new(LoopbackTransport {
        outbound: Mutex::new(tx),
    });
    let config = ServerConfig {
        device_name: "rusty-log".to_string(),
        ..Default::default()
    };
    let server = GattServer::new(config, transport, Arc::new(LogApp::default()))?;

    // Log service with one read/write characteristic
    let service = Service::primary(Uuid::from_u16(0x2222)).with_characteristic(Characteristic::new(
        Uuid::from_u16(0x1111),
        CharacteristicProperties::READ | CharacteristicProperties::WRITE,
        Permissions::READ | Permissions::WRITE,
    ));
    let handles = server.register_service(service)?;
    let log_handle = handles
        .value_handle(Uuid::from_u16(0x1111))
        .ok_or("log characteristic missing")?;
    println!("Log characteristic at handle {:#06x}", log_handle);

    server.start(Box::new(PrintingAdvertiser))?;
    let events = server.event_sender()?;
    let central = SessionId(1);
    events.send(TransportEvent::Connected(central))?;

    let response = exchange(&events, &replies, central, ParsedRequest::ExchangeMtu { client_mtu: 64 })?;
    println!("<- {:?}", response);

    for line in ["hello", "from", "a central"] {
        let request = ParsedRequest::Write {
            handle: log_handle,
            offset: 0,
            value: line.as_bytes().to_vec(),
            kind: WriteKind::Request,
        };
        println!("<- {:?}", exchange(&events, &replies, central, request)?);
    }

    // Long write in two fragments
    for (offset, fragment) in [(0u16, "long "), (5, "write")] {
        let request = ParsedRequest::Write {
            handle: log_handle,
            offset,
            value: fragment.as_bytes().to_vec(),
            kind: WriteKind::Prepare,
        };
        println!("<- {:?}", exchange(&events, &replies, central, request)?);
    }
    let response = exchange(
        &events,
        &replies,
        central,
        ParsedRequest::ExecuteWrite {
            flag: ExecuteFlag::Commit,
        },
    )?;
    println!("<- {:?}", response);

    let response = exchange(
        &events,
        &replies,
        central,
        ParsedRequest::Read { handle: log_handle },
    )?;
    if let Response::Read(read) = response {
        println!("Log:\n{}", String::from_utf8_lossy(&read.value));
    }

    events.send(TransportEvent::Disconnected(central))?;
    server.stop()?;
    Ok(())
}
