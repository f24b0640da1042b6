//! Message Types for the PeerJS server protocol
//!
//! Envelopes are JSON objects tagged by an upper-case `type`. Client
//! messages name a destination (`dst`), server messages name their source
//! (`src`). Media negotiation travels opaquely in `payload`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix PeerJS uses for media connection ids
pub const MEDIA_CONNECTION_PREFIX: &str = "mc_";

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ClientMessage {
    /// Keeps the socket from being reaped by the server
    Heartbeat,

    Offer { dst: String, payload: OfferPayload },

    Answer { dst: String, payload: AnswerPayload },

    Candidate { dst: String, payload: CandidatePayload },

    /// Tells the remote peer we are gone
    Leave { dst: String },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ServerMessage {
    /// Registration accepted, the id is ours
    Open,

    Error {
        #[serde(default)]
        payload: ErrorPayload,
    },

    IdTaken {
        #[serde(default)]
        payload: ErrorPayload,
    },

    InvalidKey {
        #[serde(default)]
        payload: ErrorPayload,
    },

    /// Remote peer disconnected
    Leave { src: String },

    /// A message we sent could not be delivered
    Expire { src: String },

    Offer { src: String, payload: OfferPayload },

    Answer { src: String, payload: AnswerPayload },

    Candidate { src: String, payload: CandidatePayload },

    Heartbeat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `RTCSessionDescriptionInit` as the browser serializes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionInit {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Media,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescriptionInit,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl OfferPayload {
    pub fn media(connection_id: String, sdp: String, metadata: Option<Value>) -> Self {
        Self {
            sdp: SessionDescriptionInit {
                kind: SdpKind::Offer,
                sdp,
            },
            connection_type: ConnectionType::Media,
            connection_id,
            metadata,
            browser: Some(user_agent()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: SessionDescriptionInit,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl AnswerPayload {
    pub fn media(connection_id: String, sdp: String) -> Self {
        Self {
            sdp: SessionDescriptionInit {
                kind: SdpKind::Answer,
                sdp,
            },
            connection_type: ConnectionType::Media,
            connection_id,
            browser: Some(user_agent()),
        }
    }
}

/// `RTCIceCandidateInit` as the browser serializes it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
}

impl CandidatePayload {
    pub fn media(connection_id: String, candidate: IceCandidate) -> Self {
        Self {
            candidate,
            connection_type: ConnectionType::Media,
            connection_id,
        }
    }
}

fn user_agent() -> String {
    format!("peercall/{}", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// TESTS
// ============================================================================
