//! WebSocket client for a PeerJS server
//!
//! Manages the socket to the signaling server:
//! - Registration (id, `OPEN` handshake)
//! - Heartbeats
//! - Event-based delivery of offers, answers and candidates

use super::messages::*;
use crate::config::PeerServerConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Protocol version advertised on the socket URL
pub const CLIENT_VERSION: &str = "1.5.4";

/// How long to wait for `OPEN` after the socket connects
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// PeerJS servers drop sockets that stay silent for much longer than this
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to obtain peer id: {0}")]
    IdUnavailable(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("ID is taken: {0}")]
    IdTaken(String),

    #[error("Invalid API key: {0}")]
    InvalidKey(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events raised by [`PeerServerClient`]
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Registration accepted
    Open { peer_id: String },

    Offer { src: String, payload: OfferPayload },

    Answer { src: String, payload: AnswerPayload },

    Candidate { src: String, payload: CandidatePayload },

    /// Remote peer went away
    Leave { src: String },

    /// A message to `src` could not be delivered
    Expire { src: String },

    Error { message: String },

    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    is_open: bool,
    peer_id: Option<String>,
}

// ============================================================================
// PEER SERVER CLIENT
// ============================================================================

/// Socket client for a PeerJS-compatible server
pub struct PeerServerClient {
    config: PeerServerConfig,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<Message>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerServerClient {
    pub fn new(config: PeerServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Our registered id, once the server sent `OPEN`
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_open
    }

    /// Asks the server to mint a fresh id
    pub async fn fetch_id(&self) -> Result<String, SignalingError> {
        let url = format!(
            "{}{}/id?ts={}{}",
            self.config.http_base(),
            self.config.key,
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u32>()
        );

        tracing::debug!("Fetching peer id from {}", url);

        let response = reqwest::get(&url)
            .await
            .map_err(|e| SignalingError::IdUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| SignalingError::IdUnavailable(e.to_string()))?;

        let id = response
            .text()
            .await
            .map_err(|e| SignalingError::IdUnavailable(e.to_string()))?
            .trim()
            .to_string();

        if id.is_empty() {
            return Err(SignalingError::IdUnavailable("empty id".to_string()));
        }
        Ok(id)
    }

    /// `ws(s)://host:port/path/peerjs?key=…&id=…&token=…&version=…`
    pub fn socket_url(&self, peer_id: &str, token: &str) -> Result<Url, SignalingError> {
        let mut url = Url::parse(&format!("{}peerjs", self.config.ws_base()))
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("key", &self.config.key)
            .append_pair("id", peer_id)
            .append_pair("token", token)
            .append_pair("version", CLIENT_VERSION);
        Ok(url)
    }

    /// Opens the socket for `peer_id` and waits for the server to accept it
    pub async fn connect(&mut self, peer_id: String) -> Result<String, SignalingError> {
        let url = self.socket_url(&peer_id, &random_token())?;

        tracing::info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(100);
        self.tx = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.is_open = false;
            state.peer_id = None;
        }

        // Registration outcome channel
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let pending_id = peer_id.clone();

        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => Self::handle_server_message(
                            server_msg,
                            &pending_id,
                            &state_clone,
                            &event_tx,
                            &reg_tx,
                        ),
                        Err(e) => {
                            tracing::warn!("Ignoring unrecognised server message ({}): {}", e, text)
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut state = state_clone.write();
                state.is_connected = false;
                state.is_open = false;
            }
            let _ = reg_tx.try_send(Err(SignalingError::ConnectionFailed(
                "socket closed".to_string(),
            )));
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        self.tasks.lock().push(reader);

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(Ok(id)) => Ok(id),
                    Some(Err(e)) => {
                        self.disconnect();
                        Err(e)
                    }
                    None => {
                        self.disconnect();
                        Err(SignalingError::RegistrationFailed("No response".to_string()))
                    }
                }
            }
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                self.disconnect();
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Sends a message through the writer task
    pub async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Non-blocking variant of [`PeerServerClient::send`]
    pub fn try_send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.try_send(Message::Text(text))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    pub async fn send_offer(&self, dst: String, payload: OfferPayload) -> Result<(), SignalingError> {
        self.send(ClientMessage::Offer { dst, payload }).await
    }

    pub async fn send_answer(
        &self,
        dst: String,
        payload: AnswerPayload,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Answer { dst, payload }).await
    }

    pub async fn send_candidate(
        &self,
        dst: String,
        payload: CandidatePayload,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Candidate { dst, payload }).await
    }

    pub fn send_heartbeat(&self) -> Result<(), SignalingError> {
        self.try_send(ClientMessage::Heartbeat)
    }

    /// Closes the socket and stops every background task
    pub fn disconnect(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(Message::Close(None));
        }

        {
            let mut state = self.state.write();
            state.is_connected = false;
            state.is_open = false;
        }

        // The writer is not tracked; it flushes the close frame and exits
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Sends a heartbeat every [`HEARTBEAT_INTERVAL`] while connected
    pub fn start_heartbeat(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if !client.is_connected() {
                    tracing::debug!("Heartbeat: client disconnected, stopping");
                    break;
                }
                if let Err(e) = client.send_heartbeat() {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn handle_server_message(
        msg: ServerMessage,
        pending_id: &str,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Open => {
                tracing::info!("Registered with peer_id {}", pending_id);
                {
                    let mut s = state.write();
                    s.is_open = true;
                    s.peer_id = Some(pending_id.to_string());
                }
                let _ = reg_tx.try_send(Ok(pending_id.to_string()));
                let _ = event_tx.send(SignalingEvent::Open {
                    peer_id: pending_id.to_string(),
                });
            }

            ServerMessage::IdTaken { payload } => {
                tracing::error!("ID '{}' is taken: {}", pending_id, payload.msg);
                let _ = reg_tx.try_send(Err(SignalingError::IdTaken(payload.msg.clone())));
                let _ = event_tx.send(SignalingEvent::Error {
                    message: payload.msg,
                });
            }

            ServerMessage::InvalidKey { payload } => {
                tracing::error!("Server rejected API key: {}", payload.msg);
                let _ = reg_tx.try_send(Err(SignalingError::InvalidKey(payload.msg.clone())));
                let _ = event_tx.send(SignalingEvent::Error {
                    message: payload.msg,
                });
            }

            ServerMessage::Error { payload } => {
                tracing::error!("Server error: {}", payload.msg);
                let _ = reg_tx.try_send(Err(SignalingError::ServerError(payload.msg.clone())));
                let _ = event_tx.send(SignalingEvent::Error {
                    message: payload.msg,
                });
            }

            ServerMessage::Leave { src } => {
                let _ = event_tx.send(SignalingEvent::Leave { src });
            }

            ServerMessage::Expire { src } => {
                tracing::warn!("Could not reach peer {}", src);
                let _ = event_tx.send(SignalingEvent::Expire { src });
            }

            ServerMessage::Offer { src, payload } => {
                let _ = event_tx.send(SignalingEvent::Offer { src, payload });
            }

            ServerMessage::Answer { src, payload } => {
                let _ = event_tx.send(SignalingEvent::Answer { src, payload });
            }

            ServerMessage::Candidate { src, payload } => {
                let _ = event_tx.send(SignalingEvent::Candidate { src, payload });
            }

            ServerMessage::Heartbeat => {}
        }
    }
}

impl Drop for PeerServerClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServerClient")
            .field("server", &self.config.ws_base())
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Per-connection secret, as the PeerJS client generates it
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(11)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Fresh media connection id (`mc_…`)
pub fn media_connection_id() -> String {
    format!("{}{}", MEDIA_CONNECTION_PREFIX, random_token())
}

// ============================================================================
// TESTS
// ============================================================================
