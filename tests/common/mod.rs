//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall::bookkeeping::{Bookkeeper, BookkeepingError, ConnectionRecord, PeerRecord};
use peercall::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind};
use peercall::peer::{CallDirection, CallLink, IncomingCall, MediaCall, PeerError, PeerService};
use peercall::signaling::media_connection_id;
use peercall::SessionEvent;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// DEVICES
// ============================================================================

/// Hands out a fresh two-track stream per request, or refuses
#[derive(Default)]
pub struct StubDevices {
    deny: bool,
    requests: AtomicUsize,
}

impl StubDevices {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Self::default()
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for StubDevices {
    async fn get_user_media(&self, _: MediaConstraints) -> Result<MediaStream, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        Ok(stub_stream())
    }
}

pub fn stub_stream() -> MediaStream {
    MediaStream::new(vec![
        MediaTrack::new(TrackKind::Audio, "stub microphone", "audio/opus"),
        MediaTrack::new(TrackKind::Video, "stub camera", "video/VP8"),
    ])
}

// ============================================================================
// BOOKKEEPING
// ============================================================================

#[derive(Default)]
pub struct RecordingBookkeeper {
    pub peers: Mutex<Vec<PeerRecord>>,
    pub connections: Mutex<Vec<ConnectionRecord>>,
}

impl RecordingBookkeeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().clone()
    }

    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl Bookkeeper for RecordingBookkeeper {
    async fn record_peer(&self, record: PeerRecord) -> Result<(), BookkeepingError> {
        self.peers.lock().push(record);
        Ok(())
    }

    async fn record_connection(&self, record: ConnectionRecord) -> Result<(), BookkeepingError> {
        self.connections.lock().push(record);
        Ok(())
    }
}

// ============================================================================
// PEER SERVICE
// ============================================================================

/// Peer double driven by the test: offers are injected, streams delivered
/// by hand through the kept [`CallLink`]s
pub struct ScriptedPeer {
    identity: String,
    fail_register: bool,
    close_on_destroy: bool,
    registered: AtomicBool,
    destroyed: AtomicBool,
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingCall>>>,
    links: Mutex<Vec<(String, Arc<CallLink>)>>,
    placed: Mutex<Vec<String>>,
    answered: Mutex<Vec<String>>,
    declined: Mutex<Vec<String>>,
}

impl ScriptedPeer {
    fn build(identity: &str, fail_register: bool, close_on_destroy: bool) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            identity: identity.to_string(),
            fail_register,
            close_on_destroy,
            registered: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            links: Mutex::new(Vec::new()),
            placed: Mutex::new(Vec::new()),
            answered: Mutex::new(Vec::new()),
            declined: Mutex::new(Vec::new()),
        })
    }

    pub fn new(identity: &str) -> Arc<Self> {
        Self::build(identity, false, true)
    }

    pub fn failing() -> Arc<Self> {
        Self::build("unused", true, true)
    }

    /// Keeps call links open through `destroy`, to model late callbacks
    pub fn sticky(identity: &str) -> Arc<Self> {
        Self::build(identity, false, false)
    }

    /// Injects an inbound offer from `from`
    pub fn offer(&self, from: &str) -> IncomingCall {
        let call = IncomingCall {
            connection_id: media_connection_id(),
            peer: from.to_string(),
            metadata: None,
        };
        let _ = self.incoming_tx.send(call.clone());
        call
    }

    pub fn link(&self, connection_id: &str) -> Option<Arc<CallLink>> {
        self.links
            .lock()
            .iter()
            .find(|(id, _)| id == connection_id)
            .map(|(_, link)| Arc::clone(link))
    }

    /// Remote identities called, in order
    pub fn placed(&self) -> Vec<String> {
        self.placed.lock().clone()
    }

    /// Connection ids answered, in order
    pub fn answered(&self) -> Vec<String> {
        self.answered.lock().clone()
    }

    /// Connection ids declined, in order
    pub fn declined(&self) -> Vec<String> {
        self.declined.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerService for ScriptedPeer {
    async fn register(&self) -> Result<String, PeerError> {
        if self.fail_register {
            return Err(PeerError::PeerUnavailable("signaling server".to_string()));
        }
        self.registered.store(true, Ordering::SeqCst);
        Ok(self.identity.clone())
    }

    fn identity(&self) -> Option<String> {
        self.registered
            .load(Ordering::SeqCst)
            .then(|| self.identity.clone())
    }

    fn incoming_calls(&self) -> Option<mpsc::UnboundedReceiver<IncomingCall>> {
        self.incoming_rx.lock().take()
    }

    async fn call(&self, remote: &str, _stream: MediaStream) -> Result<MediaCall, PeerError> {
        let (call, link) = MediaCall::new(media_connection_id(), remote, CallDirection::Outbound);
        self.links
            .lock()
            .push((call.connection_id().to_string(), Arc::new(link)));
        self.placed.lock().push(remote.to_string());
        Ok(call)
    }

    async fn answer(
        &self,
        incoming: &IncomingCall,
        _stream: MediaStream,
    ) -> Result<MediaCall, PeerError> {
        let (call, link) = MediaCall::new(
            incoming.connection_id.clone(),
            incoming.peer.clone(),
            CallDirection::Inbound,
        );
        self.links
            .lock()
            .push((incoming.connection_id.clone(), Arc::new(link)));
        self.answered.lock().push(incoming.connection_id.clone());
        Ok(call)
    }

    fn decline(&self, incoming: &IncomingCall) {
        self.declined.lock().push(incoming.connection_id.clone());
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if self.close_on_destroy {
            for (_, link) in self.links.lock().iter() {
                link.close();
            }
        }
    }
}

// ============================================================================
// WAITING
// ============================================================================

/// Next event matching `pred`, failing the test after [`WAIT`]
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Polls `cond` until it holds, failing the test after [`WAIT`]
pub async fn eventually<F>(cond: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
