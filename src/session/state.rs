//! Session states, events and errors

use crate::peer::{CallDirection, PeerError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session was already started")]
    AlreadyStarted,

    #[error("Session is not ready (state: {0})")]
    NotReady(SessionState),

    #[error("No local media stream")]
    NoLocalMedia,

    #[error("Session was terminated")]
    Terminated,

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
}

/// Lifecycle of one registration with the signaling service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Not registered yet
    Uninitialized,
    /// Waiting for the signaling service to assign an identity
    Registering,
    /// Registered and idle
    Ready,
    InCall {
        connection_id: String,
        remote: String,
        direction: CallDirection,
    },
    /// Hung up or failed to register; final
    Terminated,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    pub fn is_in_call(&self) -> bool {
        matches!(self, SessionState::InCall { .. })
    }

    /// `true` while registered with the signaling service
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Registering | SessionState::Ready | SessionState::InCall { .. }
        )
    }

    /// Remote identity of the current call
    pub fn remote(&self) -> Option<&str> {
        match self {
            SessionState::InCall { remote, .. } => Some(remote),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => f.write_str("uninitialized"),
            SessionState::Registering => f.write_str("registering"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::InCall { remote, .. } => write!(f, "in call with {}", remote),
            SessionState::Terminated => f.write_str("terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No local stream to answer with
    NoLocalMedia,
    /// Already in a call or not registered
    Busy,
}

/// Notifications for front ends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Registered {
        identity: String,
    },
    CallStarted {
        connection_id: String,
        remote: String,
        direction: CallDirection,
    },
    IncomingIgnored {
        remote: String,
        reason: IgnoreReason,
    },
    RemoteStream {
        connection_id: String,
        stream_id: String,
    },
    CallEnded {
        connection_id: String,
    },
    Terminated,
}
