//! Call Session Manager
//!
//! Owns one registration with a [`PeerService`] and at most one call at a
//! time. Asynchronous results (registration, remote streams, call closure)
//! are only applied while the session is still in the state they belong to.

use super::state::{IgnoreReason, SessionError, SessionEvent, SessionState};
use crate::bookkeeping::{self, Bookkeeper};
use crate::media::{DisplayTarget, MediaController, MediaStream};
use crate::peer::{IncomingCall, MediaCall, PeerService};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct SessionInner {
    peer: Arc<dyn PeerService>,
    media: Arc<MediaController>,
    remote_view: Arc<dyn DisplayTarget>,
    bookkeeper: Option<Arc<dyn Bookkeeper>>,
    state: RwLock<SessionState>,
    identity: RwLock<Option<String>>,
    event_tx: broadcast::Sender<SessionEvent>,
    /// Serializes placing and answering so only one call can win `Ready`
    call_guard: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share one session
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(
        peer: Arc<dyn PeerService>,
        media: Arc<MediaController>,
        remote_view: Arc<dyn DisplayTarget>,
    ) -> Self {
        Self::build(peer, media, remote_view, None)
    }

    /// Records identities and connections through `bookkeeper`
    pub fn with_bookkeeper(
        peer: Arc<dyn PeerService>,
        media: Arc<MediaController>,
        remote_view: Arc<dyn DisplayTarget>,
        bookkeeper: Arc<dyn Bookkeeper>,
    ) -> Self {
        Self::build(peer, media, remote_view, Some(bookkeeper))
    }

    fn build(
        peer: Arc<dyn PeerService>,
        media: Arc<MediaController>,
        remote_view: Arc<dyn DisplayTarget>,
        bookkeeper: Option<Arc<dyn Bookkeeper>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(SessionInner {
                peer,
                media,
                remote_view,
                bookkeeper,
                state: RwLock::new(SessionState::Uninitialized),
                identity: RwLock::new(None),
                event_tx,
                call_guard: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    /// Identity assigned at registration
    pub fn identity(&self) -> Option<String> {
        self.inner.identity.read().clone()
    }

    pub fn media(&self) -> &Arc<MediaController> {
        &self.inner.media
    }

    pub fn remote_view(&self) -> &Arc<dyn DisplayTarget> {
        &self.inner.remote_view
    }

    /// Registers with the signaling service and starts answering calls
    pub async fn start(&self) -> Result<String, SessionError> {
        {
            let mut state = self.inner.state.write();
            if *state != SessionState::Uninitialized {
                return Err(SessionError::AlreadyStarted);
            }
            *state = SessionState::Registering;
        }

        let identity = match self.inner.peer.register().await {
            Ok(identity) => identity,
            Err(e) => {
                let hung_up = {
                    let mut state = self.inner.state.write();
                    let hung_up = *state == SessionState::Terminated;
                    *state = SessionState::Terminated;
                    hung_up
                };
                if hung_up {
                    tracing::info!("Session ended before registration completed");
                    return Err(SessionError::Terminated);
                }

                tracing::error!("Registration failed: {}", e);
                self.emit(SessionEvent::Terminated);
                return Err(e.into());
            }
        };

        let registered = {
            let mut state = self.inner.state.write();
            if *state == SessionState::Registering {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        };
        if !registered {
            // Hung up while registering
            tracing::info!("Session ended before registration completed");
            self.inner.peer.destroy().await;
            return Err(SessionError::Terminated);
        }

        *self.inner.identity.write() = Some(identity.clone());
        tracing::info!("Session ready, identity {}", identity);
        self.emit(SessionEvent::Registered {
            identity: identity.clone(),
        });

        if let Some(bookkeeper) = &self.inner.bookkeeper {
            bookkeeping::record_peer(bookkeeper, &identity);
        }

        self.spawn_listener();
        Ok(identity)
    }

    /// Calls `remote` with the local stream
    ///
    /// Returns the connection id. Without a local stream no call is created.
    pub async fn place_call(&self, remote: &str) -> Result<String, SessionError> {
        let _guard = self.inner.call_guard.lock().await;

        let Some(stream) = self.inner.media.current() else {
            tracing::warn!("Cannot call {}: no local media", remote);
            return Err(SessionError::NoLocalMedia);
        };

        let state = self.state();
        if !state.is_ready() {
            tracing::warn!("Cannot call {}: session is {}", remote, state);
            return Err(SessionError::NotReady(state));
        }

        let call = match self.inner.peer.call(remote, stream).await {
            Ok(call) => call,
            Err(e) => {
                tracing::error!("Failed to call {}: {}", remote, e);
                return Err(e.into());
            }
        };

        let connection_id = call.connection_id().to_string();
        self.enter_call(call)?;
        Ok(connection_id)
    }

    /// Releases media, leaves the signaling service and clears both views
    ///
    /// Returns `false` when there was no session to end.
    pub async fn hang_up(&self) -> bool {
        let previous = {
            let mut state = self.inner.state.write();
            match *state {
                SessionState::Uninitialized | SessionState::Terminated => None,
                _ => Some(std::mem::replace(&mut *state, SessionState::Terminated)),
            }
        };

        let Some(previous) = previous else {
            tracing::info!("Hang up: no active session");
            return false;
        };

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        self.inner.media.release();
        self.inner.peer.destroy().await;
        self.inner.media.clear_preview();
        self.inner.remote_view.set_source(None);

        tracing::info!("Hung up (was {})", previous);
        self.emit(SessionEvent::Terminated);
        true
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Keeps `task` for abort on hang up, dropping handles of finished ones
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn from_weak(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn is_in_call(&self, connection_id: &str) -> bool {
        matches!(
            &*self.inner.state.read(),
            SessionState::InCall { connection_id: current, .. } if current == connection_id
        )
    }

    fn spawn_listener(&self) {
        let Some(mut incoming) = self.inner.peer.incoming_calls() else {
            tracing::warn!("Incoming calls are already handled elsewhere");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(offer) = incoming.recv().await {
                let Some(session) = Self::from_weak(&weak) else {
                    break;
                };
                session.handle_incoming(offer).await;
            }
            tracing::debug!("Incoming call listener stopped");
        });
        self.track(task);
    }

    async fn handle_incoming(&self, offer: IncomingCall) {
        let _guard = self.inner.call_guard.lock().await;

        let Some(stream) = self.inner.media.current() else {
            tracing::warn!("Ignoring call from {}: no local media", offer.peer);
            self.inner.peer.decline(&offer);
            self.emit(SessionEvent::IncomingIgnored {
                remote: offer.peer,
                reason: IgnoreReason::NoLocalMedia,
            });
            return;
        };

        let state = self.state();
        if !state.is_ready() {
            tracing::info!("Ignoring call from {}: session is {}", offer.peer, state);
            self.inner.peer.decline(&offer);
            self.emit(SessionEvent::IncomingIgnored {
                remote: offer.peer,
                reason: IgnoreReason::Busy,
            });
            return;
        }

        tracing::info!("Answering call from {}", offer.peer);
        match self.inner.peer.answer(&offer, stream).await {
            Ok(call) => {
                if let Err(e) = self.enter_call(call) {
                    tracing::warn!("Answered call from {} dropped: {}", offer.peer, e);
                }
            }
            Err(e) => tracing::error!("Failed to answer {}: {}", offer.peer, e),
        }
    }

    /// Moves `Ready → InCall` and watches the call's stream and closure
    fn enter_call(&self, mut call: MediaCall) -> Result<(), SessionError> {
        let connection_id = call.connection_id().to_string();
        let remote = call.peer().to_string();
        let direction = call.direction();

        {
            let mut state = self.inner.state.write();
            if !state.is_ready() {
                return Err(SessionError::NotReady(state.clone()));
            }
            *state = SessionState::InCall {
                connection_id: connection_id.clone(),
                remote: remote.clone(),
                direction,
            };
        }

        tracing::info!("In call {} with {}", connection_id, remote);
        self.emit(SessionEvent::CallStarted {
            connection_id: connection_id.clone(),
            remote: remote.clone(),
            direction,
        });

        if let (Some(bookkeeper), Some(identity)) = (&self.inner.bookkeeper, self.identity()) {
            bookkeeping::record_connection(bookkeeper, &identity, &remote);
        }

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let closed = call.closed();

            match call.remote_stream().await {
                Ok(stream) => {
                    if let Some(session) = Self::from_weak(&weak) {
                        session.bind_remote(&connection_id, stream).await;
                    }
                }
                Err(e) => tracing::warn!("Call {} produced no remote media: {}", connection_id, e),
            }

            closed.await;
            if let Some(session) = Self::from_weak(&weak) {
                session.end_call(&connection_id);
            }
        });
        self.track(task);

        Ok(())
    }

    async fn bind_remote(&self, connection_id: &str, stream: MediaStream) {
        // The stream stays owned by the peer service, which ends it on close
        if !self.is_in_call(connection_id) {
            tracing::debug!("Discarding remote stream of stale call {}", connection_id);
            return;
        }

        tracing::info!("Remote stream {} arrived", stream.id());
        self.inner.remote_view.set_source(Some(stream.clone()));
        if let Err(e) = self.inner.remote_view.play().await {
            tracing::warn!("Failed to play remote stream: {}", e);
        }

        self.emit(SessionEvent::RemoteStream {
            connection_id: connection_id.to_string(),
            stream_id: stream.id().to_string(),
        });
    }

    fn end_call(&self, connection_id: &str) {
        let ended = {
            let mut state = self.inner.state.write();
            let current = matches!(
                &*state,
                SessionState::InCall { connection_id: current, .. } if current == connection_id
            );
            if current {
                *state = SessionState::Ready;
            }
            current
        };

        if ended {
            tracing::info!("Call {} ended", connection_id);
            self.inner.remote_view.set_source(None);
            self.emit(SessionEvent::CallEnded {
                connection_id: connection_id.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
