//! Session Module - registration and call lifecycle
//!
//! `Uninitialized → Registering → Ready ⇄ InCall → Terminated`

mod manager;
mod state;

pub use manager::CallSession;
pub use state::{IgnoreReason, SessionError, SessionEvent, SessionState};
