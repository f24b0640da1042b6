//! In-process relay
//!
//! Every [`MemoryPeer`] created from the same [`MemoryRelay`] can reach the
//! others by identity. Answering a call swaps the two local streams directly,
//! no network involved.

use super::{CallDirection, CallLink, IncomingCall, MediaCall, PeerError, PeerService};
use crate::media::MediaStream;
use crate::signaling::{media_connection_id, SignalingError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct PendingOffer {
    caller: String,
    stream: MediaStream,
    link: Arc<CallLink>,
}

struct ActiveCall {
    remote: String,
    link: Arc<CallLink>,
}

struct PeerEntry {
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
    /// Offers received, keyed by connection id
    pending: HashMap<String, PendingOffer>,
    /// Calls placed or answered, keyed by connection id
    active: HashMap<String, ActiveCall>,
}

#[derive(Default)]
struct RelayState {
    peers: HashMap<String, PeerEntry>,
}

/// Shared switchboard for [`MemoryPeer`]s
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A peer that gets a random identity on registration
    pub fn peer(&self) -> MemoryPeer {
        MemoryPeer::new(self.clone(), None)
    }

    /// A peer that asks for a specific identity
    pub fn peer_with_id(&self, id: impl Into<String>) -> MemoryPeer {
        MemoryPeer::new(self.clone(), Some(id.into()))
    }

    /// Identities currently registered
    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live calls on both ends, summed over all peers
    pub fn active_calls(&self) -> usize {
        self.state
            .lock()
            .peers
            .values()
            .map(|entry| entry.active.len())
            .sum()
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("registered", &self.registered())
            .finish()
    }
}

/// One endpoint on a [`MemoryRelay`]
pub struct MemoryPeer {
    relay: MemoryRelay,
    requested_id: Option<String>,
    identity: RwLock<Option<String>>,
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingCall>>>,
    destroyed: AtomicBool,
    metadata: Option<Value>,
}

impl MemoryPeer {
    fn new(relay: MemoryRelay, requested_id: Option<String>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Self {
            relay,
            requested_id,
            identity: RwLock::new(None),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            destroyed: AtomicBool::new(false),
            metadata: None,
        }
    }

    /// Metadata attached to every offer this peer sends
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn require_identity(&self) -> Result<String, PeerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        self.identity.read().clone().ok_or(PeerError::NotRegistered)
    }
}

#[async_trait]
impl PeerService for MemoryPeer {
    async fn register(&self) -> Result<String, PeerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        if self.identity.read().is_some() {
            return Err(PeerError::AlreadyRegistered);
        }

        let id = self
            .requested_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        {
            let mut state = self.relay.state.lock();
            if state.peers.contains_key(&id) {
                return Err(SignalingError::IdTaken(id).into());
            }
            state.peers.insert(
                id.clone(),
                PeerEntry {
                    incoming_tx: self.incoming_tx.clone(),
                    pending: HashMap::new(),
                    active: HashMap::new(),
                },
            );
        }

        *self.identity.write() = Some(id.clone());
        tracing::debug!("Relay peer registered as {}", id);
        Ok(id)
    }

    fn identity(&self) -> Option<String> {
        self.identity.read().clone()
    }

    fn incoming_calls(&self) -> Option<mpsc::UnboundedReceiver<IncomingCall>> {
        self.incoming_rx.lock().take()
    }

    async fn call(&self, remote: &str, stream: MediaStream) -> Result<MediaCall, PeerError> {
        let me = self.require_identity()?;
        let connection_id = media_connection_id();
        let (call, link) = MediaCall::new(connection_id.clone(), remote, CallDirection::Outbound);
        let link = Arc::new(link);

        let mut state = self.relay.state.lock();

        if let Some(entry) = state.peers.get_mut(&me) {
            entry.active.insert(
                connection_id.clone(),
                ActiveCall {
                    remote: remote.to_string(),
                    link: Arc::clone(&link),
                },
            );
        }

        let delivered = match state.peers.get_mut(remote) {
            Some(entry) => {
                let offer = IncomingCall {
                    connection_id: connection_id.clone(),
                    peer: me.clone(),
                    metadata: self.metadata.clone(),
                };
                entry.pending.insert(
                    connection_id.clone(),
                    PendingOffer {
                        caller: me.clone(),
                        stream,
                        link: Arc::clone(&link),
                    },
                );
                if entry.incoming_tx.send(offer).is_ok() {
                    true
                } else {
                    entry.pending.remove(&connection_id);
                    false
                }
            }
            None => false,
        };

        if !delivered {
            // The handle still exists; the failure arrives on it
            tracing::debug!("Relay: {} is not reachable", remote);
            if let Some(entry) = state.peers.get_mut(&me) {
                entry.active.remove(&connection_id);
            }
            link.fail(PeerError::PeerUnavailable(remote.to_string()));
        }

        Ok(call)
    }

    async fn answer(
        &self,
        incoming: &IncomingCall,
        stream: MediaStream,
    ) -> Result<MediaCall, PeerError> {
        let me = self.require_identity()?;
        let mut state = self.relay.state.lock();

        let entry = state.peers.get_mut(&me).ok_or(PeerError::NotRegistered)?;
        let offer = entry
            .pending
            .remove(&incoming.connection_id)
            .ok_or_else(|| PeerError::UnknownCall(incoming.connection_id.clone()))?;

        if offer.link.is_closed() {
            return Err(PeerError::CallClosed);
        }

        let (call, link) = MediaCall::new(
            incoming.connection_id.clone(),
            offer.caller.clone(),
            CallDirection::Inbound,
        );
        let link = Arc::new(link);

        link.deliver(offer.stream);
        offer.link.deliver(stream);

        entry.active.insert(
            incoming.connection_id.clone(),
            ActiveCall {
                remote: offer.caller,
                link,
            },
        );

        Ok(call)
    }

    /// The caller sees its call close, as if the far end hung up
    fn decline(&self, incoming: &IncomingCall) {
        let Some(me) = self.identity.read().clone() else {
            return;
        };

        let mut state = self.relay.state.lock();
        let offer = state
            .peers
            .get_mut(&me)
            .and_then(|entry| entry.pending.remove(&incoming.connection_id));
        let Some(offer) = offer else {
            return;
        };

        offer.link.close();
        if let Some(caller) = state.peers.get_mut(&offer.caller) {
            caller.active.remove(&incoming.connection_id);
        }
        tracing::debug!("Relay: {} declined {}", me, incoming.connection_id);
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(me) = self.identity.write().take() else {
            return;
        };

        let mut state = self.relay.state.lock();
        let Some(entry) = state.peers.remove(&me) else {
            return;
        };

        for (_, offer) in entry.pending {
            offer.link.close();
        }

        for (connection_id, call) in entry.active {
            call.link.close();
            if let Some(remote) = state.peers.get_mut(&call.remote) {
                if let Some(other) = remote.active.remove(&connection_id) {
                    other.link.close();
                }
                // Unanswered offer we placed
                if let Some(offer) = remote.pending.remove(&connection_id) {
                    offer.link.close();
                }
            }
        }

        tracing::debug!("Relay peer {} destroyed", me);
    }
}

// ============================================================================
// TESTS
// ============================================================================
