//! Peer Module - the signaling/relay capability
//!
//! [`PeerService`] is the narrow surface the call session needs from a
//! signaling service: register, call, answer, receive offers, destroy.
//!
//! Implementations:
//! - [`RtcPeer`]: PeerJS server plus one WebRTC peer connection per call
//! - [`MemoryRelay`]: in-process relay that hands streams across directly

mod memory;
mod rtc;

pub use memory::{MemoryPeer, MemoryRelay};
pub use rtc::RtcPeer;

use crate::media::MediaStream;
use crate::signaling::SignalingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Peer is not registered")]
    NotRegistered,

    #[error("Peer is already registered")]
    AlreadyRegistered,

    #[error("Peer has been destroyed")]
    Destroyed,

    #[error("Could not connect to peer {0}")]
    PeerUnavailable(String),

    #[error("Unknown call {0}")]
    UnknownCall(String),

    #[error("Call was closed before media arrived")]
    CallClosed,

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

// ============================================================================
// CALLS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// An offer waiting to be answered
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub connection_id: String,
    /// Caller identity
    pub peer: String,
    pub metadata: Option<Value>,
}

/// Handle to one placed or answered call
///
/// The remote stream arrives through [`MediaCall::remote_stream`], closure
/// through [`MediaCall::closed`].
pub struct MediaCall {
    connection_id: String,
    peer: String,
    direction: CallDirection,
    stream_rx: Option<oneshot::Receiver<Result<MediaStream, PeerError>>>,
    closed_rx: watch::Receiver<bool>,
}

/// Implementation side of a [`MediaCall`]
pub struct CallLink {
    stream_tx: Mutex<Option<oneshot::Sender<Result<MediaStream, PeerError>>>>,
    closed_tx: watch::Sender<bool>,
}

impl MediaCall {
    pub fn new(
        connection_id: impl Into<String>,
        peer: impl Into<String>,
        direction: CallDirection,
    ) -> (Self, CallLink) {
        let (stream_tx, stream_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        (
            Self {
                connection_id: connection_id.into(),
                peer: peer.into(),
                direction,
                stream_rx: Some(stream_rx),
                closed_rx,
            },
            CallLink {
                stream_tx: Mutex::new(Some(stream_tx)),
                closed_tx,
            },
        )
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Identity of the far end
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Waits for the far end's media; yields once, later calls fail
    pub async fn remote_stream(&mut self) -> Result<MediaStream, PeerError> {
        let rx = self.stream_rx.take().ok_or(PeerError::CallClosed)?;
        rx.await.unwrap_or(Err(PeerError::CallClosed))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves when the call ends for any reason
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.closed_rx.clone();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }
}

impl fmt::Debug for MediaCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaCall")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CallLink {
    /// Hands the remote stream to the call; `false` if already settled
    pub fn deliver(&self, stream: MediaStream) -> bool {
        match self.stream_tx.lock().take() {
            Some(tx) => tx.send(Ok(stream)).is_ok(),
            None => false,
        }
    }

    /// Fails the pending stream and closes the call
    pub fn fail(&self, error: PeerError) -> bool {
        let settled = match self.stream_tx.lock().take() {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        };
        self.close();
        settled
    }

    /// Marks the call closed; idempotent
    pub fn close(&self) {
        if let Some(tx) = self.stream_tx.lock().take() {
            let _ = tx.send(Err(PeerError::CallClosed));
        }
        self.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

// ============================================================================
// PEER SERVICE
// ============================================================================

#[async_trait]
pub trait PeerService: Send + Sync {
    /// Registers with the signaling service and returns the assigned identity
    async fn register(&self) -> Result<String, PeerError>;

    /// Assigned identity, while registered
    fn identity(&self) -> Option<String>;

    /// Receiver of inbound offers; handed out once
    fn incoming_calls(&self) -> Option<mpsc::UnboundedReceiver<IncomingCall>>;

    /// Places a call carrying `stream`
    ///
    /// The returned handle exists before the far end answers; failures after
    /// this point surface through [`MediaCall::remote_stream`].
    async fn call(&self, remote: &str, stream: MediaStream) -> Result<MediaCall, PeerError>;

    async fn answer(&self, call: &IncomingCall, stream: MediaStream)
        -> Result<MediaCall, PeerError>;

    /// Forgets an offer that will not be answered
    fn decline(&self, _call: &IncomingCall) {}

    /// Closes every call and leaves the signaling service; idempotent
    async fn destroy(&self);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivered_stream_resolves_once() {
        let (mut call, link) = MediaCall::new("mc_1", "bob", CallDirection::Outbound);
        let stream = MediaStream::new(vec![]);

        assert!(link.deliver(stream.clone()));
        assert!(!link.deliver(stream.clone()));
        assert_eq!(call.remote_stream().await.unwrap(), stream);
        assert!(matches!(call.remote_stream().await, Err(PeerError::CallClosed)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_stream() {
        let (mut call, link) = MediaCall::new("mc_1", "bob", CallDirection::Inbound);
        link.close();
        link.close();

        assert!(call.is_closed());
        call.closed().await;
        assert!(matches!(call.remote_stream().await, Err(PeerError::CallClosed)));
    }

    #[tokio::test]
    async fn test_fail_reports_error() {
        let (mut call, link) = MediaCall::new("mc_1", "ghost", CallDirection::Outbound);
        assert!(link.fail(PeerError::PeerUnavailable("ghost".to_string())));
        assert!(matches!(
            call.remote_stream().await,
            Err(PeerError::PeerUnavailable(id)) if id == "ghost"
        ));
        assert!(link.is_closed());
    }
}
