//! Signaling Module - WebSocket client for a PeerJS server
//!
//! This module handles communication with the signaling server:
//! - Obtaining an id and registering it over the socket
//! - Keeping the socket alive with heartbeats
//! - Parsing incoming offers/answers/candidates into events
//!

mod client;
mod messages;

pub use client::{
    media_connection_id, random_token, PeerServerClient, SignalingError, SignalingEvent,
    CLIENT_VERSION, HEARTBEAT_INTERVAL, REGISTRATION_TIMEOUT,
};
pub use messages::*;
