//! Session tracking
//!
//! A [`Session`] is the server-side state of one connected peer: lifecycle
//! state, negotiated MTU, long-write buffers, long-read snapshots, CCCD
//! subscriptions and the outbound notification queue. [`SessionManager`] owns
//! the live sessions and guarantees each is torn down exactly once.

use super::notify::{NotificationQueue, Outbound, OutboundKind, PumpReport};
use super::registry::ServiceRegistry;
use super::types::{CloseReason, SessionState, Subscription};
use crate::att::{self, HandleValueIndication, HandleValueNotification, Response, ATT_DEFAULT_MTU};
use crate::error::{GattError, GattResult};
use crate::transport::{SessionId, Transport};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Work item for a session worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    /// Inbound PDU
    Pdu(Vec<u8>),
    /// Transport has room again
    Drained,
    /// Recompute the indication deadline
    Wake,
    /// Stop the worker
    Shutdown,
}

#[derive(Debug, Default)]
struct SessionData {
    prepared: BTreeMap<u16, Vec<u8>>,
    snapshots: HashMap<u16, Arc<[u8]>>,
    subscriptions: HashMap<u16, Subscription>,
}

/// Server-side state of one connected peer
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: AtomicU8,
    mtu: AtomicU16,
    data: Mutex<SessionData>,
    queue: Mutex<NotificationQueue>,
    worker: Mutex<Option<Sender<SessionEvent>>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, queue_capacity: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(SessionState::Connecting as u8),
            mtu: AtomicU16::new(ATT_DEFAULT_MTU),
            data: Mutex::new(SessionData::default()),
            queue: Mutex::new(NotificationQueue::new(queue_capacity)),
            worker: Mutex::new(None),
        }
    }

    /// Peer identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Negotiated ATT MTU
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> GattResult<()> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(GattError::SessionClosed)
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Handle an Exchange MTU Request, returning the MTU now in effect.
    ///
    /// The first exchange clamps `client_mtu` to `23..=server_max` and moves
    /// the session to `Ready`. The MTU is fixed from then on; later exchanges
    /// report it unchanged.
    pub fn begin_mtu_exchange(&self, client_mtu: u16, server_max: u16) -> GattResult<u16> {
        self.ensure_open()?;
        if !self.transition(SessionState::Connecting, SessionState::Negotiating) {
            return Ok(self.mtu());
        }

        let chosen = client_mtu.clamp(ATT_DEFAULT_MTU, server_max.max(ATT_DEFAULT_MTU));
        self.mtu.fetch_max(chosen, Ordering::SeqCst);
        self.transition(SessionState::Negotiating, SessionState::Ready);
        debug!("{}: MTU negotiated to {}", self.id, self.mtu());
        Ok(self.mtu())
    }

    /// Move to `Ready` on the first non-MTU request. Returns true if this call
    /// made the transition.
    pub fn mark_ready(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Ready)
    }

    /// Buffer one Prepare Write fragment.
    ///
    /// Fragments must arrive in order: `offset` has to equal the bytes already
    /// buffered for the handle. A mismatch leaves the buffer untouched.
    pub fn prepare_write(
        &self,
        handle: u16,
        offset: u16,
        value: &[u8],
        max_len: usize,
    ) -> GattResult<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;

        let buffered = data.prepared.get(&handle).map_or(0, Vec::len);
        if offset as usize != buffered {
            return Err(GattError::OffsetMismatch {
                offset,
                expected: buffered,
            });
        }
        if buffered + value.len() > max_len {
            return Err(GattError::PrepareQueueFull(handle));
        }

        data.prepared
            .entry(handle)
            .or_default()
            .extend_from_slice(value);
        Ok(())
    }

    /// Drain all long-write buffers, in handle order
    pub fn take_prepared(&self) -> GattResult<Vec<(u16, Vec<u8>)>> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        Ok(std::mem::take(&mut data.prepared).into_iter().collect())
    }

    /// Apply writes to the registry if the session is still open.
    ///
    /// The state check and the mutation happen under the session lock, so a
    /// write whose session closed meanwhile is dropped.
    pub fn commit_writes(
        &self,
        registry: &ServiceRegistry,
        batch: Vec<(u16, Arc<[u8]>)>,
    ) -> GattResult<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        let handles: Vec<u16> = batch.iter().map(|(handle, _)| *handle).collect();
        registry.set_values(batch)?;
        for handle in handles {
            data.snapshots.remove(&handle);
        }
        Ok(())
    }

    /// Serve one chunk of a (possibly long) read.
    ///
    /// Offset 0 always takes a fresh snapshot from `source`; later offsets are
    /// served from the same snapshot so the reader sees one consistent value.
    /// An offset at or beyond the end yields an empty chunk. The snapshot is
    /// released once a short chunk tells the peer it has reached the end.
    pub fn read_chunk<F>(&self, handle: u16, offset: u16, max: usize, source: F) -> GattResult<Vec<u8>>
    where
        F: FnOnce() -> GattResult<Arc<[u8]>>,
    {
        self.ensure_open()?;
        let existing = if offset == 0 {
            None
        } else {
            self.data
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshots
                .get(&handle)
                .cloned()
        };
        let snapshot = match existing {
            Some(snapshot) => snapshot,
            None => source()?,
        };

        let start = (offset as usize).min(snapshot.len());
        let end = (start + max).min(snapshot.len());
        let chunk = snapshot[start..end].to_vec();

        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        if chunk.len() < max {
            data.snapshots.remove(&handle);
        } else {
            data.snapshots.insert(handle, snapshot);
        }
        Ok(chunk)
    }

    /// CCCD state for a characteristic value handle
    pub fn subscription(&self, value_handle: u16) -> Subscription {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .get(&value_handle)
            .copied()
            .unwrap_or_default()
    }

    /// Update CCCD state for a characteristic value handle
    pub fn set_subscription(&self, value_handle: u16, subscription: Subscription) -> GattResult<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        if subscription == Subscription::default() {
            data.subscriptions.remove(&value_handle);
        } else {
            data.subscriptions.insert(value_handle, subscription);
        }
        Ok(())
    }

    /// Queue a notification or indication for this peer.
    ///
    /// The peer must have subscribed through the CCCD and the value must fit
    /// in `mtu - 3` bytes.
    pub fn enqueue_value(&self, handle: u16, value: &[u8], kind: OutboundKind) -> GattResult<()> {
        self.ensure_open()?;
        let subscription = self.subscription(handle);
        let subscribed = match kind {
            OutboundKind::Notification => subscription.notify,
            OutboundKind::Indication => subscription.indicate,
        };
        if !subscribed {
            return Err(GattError::NotSubscribed(handle));
        }

        let response = match kind {
            OutboundKind::Notification => Response::Notification(HandleValueNotification {
                handle,
                value: value.to_vec(),
            }),
            OutboundKind::Indication => Response::Indication(HandleValueIndication {
                handle,
                value: value.to_vec(),
            }),
        };
        let pdu = att::encode(&response, self.mtu()).map_err(GattError::Encode)?;

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enqueue(Outbound { handle, kind, pdu })
    }

    /// Send whatever the queue allows right now
    pub fn pump(&self, transport: &dyn Transport, indication_timeout: Duration) -> GattResult<PumpReport> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        queue.pump(indication_timeout, |pdu| transport.send(self.id, pdu))
    }

    /// Transport signalled room in its send buffer
    pub fn resume_queue(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resume();
    }

    /// Handle Value Confirmation arrived. Returns false if nothing was outstanding.
    pub fn confirm_indication(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .confirm()
    }

    /// Deadline of the unconfirmed indication
    pub fn indication_deadline(&self) -> Option<Instant> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deadline()
    }

    /// Entries waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn attach_worker(&self, sender: Sender<SessionEvent>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Post work to the session worker. Returns false if there is no worker.
    pub(crate) fn post(&self, event: SessionEvent) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| worker.send(event).is_ok())
    }

    /// Claim the teardown. Exactly one caller ever gets true.
    fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !SessionState::from_u8(current).is_open() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn finish_close(&self) {
        {
            let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
            *data = SessionData::default();
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);

        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.send(SessionEvent::Shutdown);
        }
    }
}

/// Owner of all live sessions
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_sessions: usize,
    queue_capacity: usize,
}

impl SessionManager {
    /// Create a manager admitting at most `max_sessions` peers
    pub fn new(max_sessions: usize, queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            queue_capacity,
        }
    }

    /// Open a session for a newly connected peer.
    ///
    /// Returns `(session, created)`; an already open session is returned as is.
    pub fn connect(&self, id: SessionId) -> GattResult<(Arc<Session>, bool)> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&id) {
            if existing.state().is_open() {
                return Ok((Arc::clone(existing), false));
            }
        }
        sessions.retain(|_, session| session.state().is_open());
        if sessions.len() >= self.max_sessions {
            warn!("{}: rejected, {} sessions open", id, sessions.len());
            return Err(GattError::TooManySessions);
        }

        let session = Arc::new(Session::new(id, self.queue_capacity));
        sessions.insert(id, Arc::clone(&session));
        info!("{}: connected", id);
        Ok((session, true))
    }

    /// Look up an open session
    pub fn get(&self, id: SessionId) -> GattResult<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .filter(|session| session.state().is_open())
            .cloned()
            .ok_or(GattError::SessionClosed)
    }

    /// State of a session; unknown sessions report `Closed`
    pub fn state(&self, id: SessionId) -> SessionState {
        self.get(id)
            .map(|session| session.state())
            .unwrap_or(SessionState::Closed)
    }

    /// Tear a session down. Only the first call for a session does anything
    /// and returns true.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> bool {
        let session = match self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            Some(session) => Arc::clone(session),
            None => return false,
        };

        if !session.begin_close() {
            return false;
        }
        session.finish_close();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, s| !Arc::ptr_eq(s, &session));
        info!("{}: closed ({:?})", id, reason);
        true
    }

    /// Snapshot of the open sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|session| session.state().is_open())
            .cloned()
            .collect()
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Whether no session is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn snapshot(bytes: &[u8]) -> GattResult<Arc<[u8]>> {
        Ok(Arc::from(bytes.to_vec()))
    }

    #[test]
    fn test_mtu_clamped_and_fixed() {
        let session = Session::new(SessionId(1), 4);
        assert_eq!(session.begin_mtu_exchange(10, 517).unwrap(), 23);
        assert_eq!(session.state(), SessionState::Ready);

        // Fixed once Ready
        assert_eq!(session.begin_mtu_exchange(185, 517).unwrap(), 23);

        let session = Session::new(SessionId(2), 4);
        assert_eq!(session.begin_mtu_exchange(1000, 247).unwrap(), 247);
        assert_eq!(session.begin_mtu_exchange(100, 247).unwrap(), 247);
    }

    #[test]
    fn test_prepare_write_offset_mismatch_leaves_buffer() {
        let session = Session::new(SessionId(1), 4);
        session.prepare_write(3, 0, b"AB", 512).unwrap();

        assert_eq!(
            session.prepare_write(3, 5, b"CD", 512),
            Err(GattError::OffsetMismatch {
                offset: 5,
                expected: 2
            })
        );
        // A fresh handle with a non-zero offset does not leave an empty buffer behind
        assert!(session.prepare_write(4, 1, b"X", 512).is_err());

        session.prepare_write(3, 2, b"CD", 512).unwrap();
        assert_eq!(session.take_prepared().unwrap(), vec![(3, b"ABCD".to_vec())]);
        assert!(session.take_prepared().unwrap().is_empty());
    }

    #[test]
    fn test_prepare_write_limit() {
        let session = Session::new(SessionId(1), 4);
        session.prepare_write(3, 0, &[0u8; 8], 10).unwrap();
        assert_eq!(
            session.prepare_write(3, 8, &[0u8; 3], 10),
            Err(GattError::PrepareQueueFull(3))
        );
    }

    #[test]
    fn test_long_read_serves_one_snapshot() {
        let session = Session::new(SessionId(1), 4);
        let chunk = session.read_chunk(3, 0, 4, || snapshot(b"abcdefghij")).unwrap();
        assert_eq!(chunk, b"abcd");

        // Later offsets ignore the (changed) source
        let chunk = session.read_chunk(3, 4, 4, || snapshot(b"XXXXXXXXXX")).unwrap();
        assert_eq!(chunk, b"efgh");
        let chunk = session.read_chunk(3, 8, 4, || snapshot(b"XXXXXXXXXX")).unwrap();
        assert_eq!(chunk, b"ij");

        // Snapshot released after the short chunk
        let chunk = session.read_chunk(3, 8, 4, || snapshot(b"0123456789")).unwrap();
        assert_eq!(chunk, b"89");
    }

    #[test]
    fn test_read_beyond_end_is_empty() {
        let session = Session::new(SessionId(1), 4);
        assert!(session.read_chunk(3, 0, 22, || snapshot(b"")).unwrap().is_empty());
        assert!(session.read_chunk(3, 5, 22, || snapshot(b"")).unwrap().is_empty());
        assert!(session.read_chunk(3, 50, 22, || snapshot(b"abc")).unwrap().is_empty());
    }

    #[test]
    fn test_close_runs_once() {
        let manager = Arc::new(SessionManager::new(4, 4));
        let (session, created) = manager.connect(SessionId(7)).unwrap();
        assert!(created);

        let winners: usize = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.close(SessionId(7), CloseReason::PeerDisconnected))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(manager.get(SessionId(7)).unwrap_err(), GattError::SessionClosed);
        assert_eq!(
            session.prepare_write(3, 0, b"A", 512),
            Err(GattError::SessionClosed)
        );
    }

    #[test]
    fn test_session_limit() {
        let manager = SessionManager::new(1, 4);
        manager.connect(SessionId(1)).unwrap();
        assert_eq!(
            manager.connect(SessionId(2)).unwrap_err(),
            GattError::TooManySessions
        );

        // Reconnecting the same peer is not a new session
        assert!(!manager.connect(SessionId(1)).unwrap().1);

        manager.close(SessionId(1), CloseReason::PeerDisconnected);
        assert!(manager.connect(SessionId(2)).is_ok());
    }

    #[test]
    fn test_enqueue_requires_subscription() {
        let session = Session::new(SessionId(1), 4);
        assert_eq!(
            session.enqueue_value(3, b"hi", OutboundKind::Notification),
            Err(GattError::NotSubscribed(3))
        );

        session
            .set_subscription(
                3,
                Subscription {
                    notify: true,
                    indicate: false,
                },
            )
            .unwrap();
        session
            .enqueue_value(3, b"hi", OutboundKind::Notification)
            .unwrap();
        assert_eq!(
            session.enqueue_value(3, b"hi", OutboundKind::Indication),
            Err(GattError::NotSubscribed(3))
        );

        // Default MTU leaves 20 bytes for the value
        assert!(matches!(
            session.enqueue_value(3, &[0u8; 21], OutboundKind::Notification),
            Err(GattError::Encode(_))
        ));
        assert_eq!(session.queued(), 1);
    }
}
