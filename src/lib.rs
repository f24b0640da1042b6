//! PeerCall - P2P video calls over a PeerJS signaling server
//!
//! A minimal video-call client with:
//! - A PeerJS-compatible signaling client (WebSocket + HTTP id endpoint)
//! - WebRTC media per call
//! - A single local stream shown in a preview, a remote stream per call
//! - Optional HTTP bookkeeping of identities and connections

pub mod app;
pub mod bookkeeping;
pub mod config;
pub mod logging;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use app::{App, AppError, AppView, Launch};
pub use config::{AppConfig, ConfigError};
pub use session::{CallSession, SessionError, SessionEvent, SessionState};
