//! PeerJS-compatible peer over WebRTC
//!
//! Signaling goes through [`PeerServerClient`]; every call gets its own
//! [`MediaConnection`]. A dispatcher task routes server events to the
//! connection they belong to.

mod connection;

use crate::config::{IceServerConfig, PeerServerConfig};
use crate::media::MediaStream;
use crate::peer::{CallDirection, IncomingCall, MediaCall, PeerError, PeerService};
use crate::signaling::{
    media_connection_id, AnswerPayload, ClientMessage, ConnectionType, OfferPayload,
    PeerServerClient, SignalingEvent,
};
use async_trait::async_trait;
use connection::{from_ice_candidate, MediaConnection};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// An offer received but not answered yet
struct PendingOffer {
    src: String,
    sdp: String,
    candidates: Vec<RTCIceCandidateInit>,
}

/// Candidates for a connection id we have not seen an offer for yet
struct EarlyCandidates {
    src: String,
    candidates: Vec<RTCIceCandidateInit>,
}

/// State shared with the dispatcher task
///
/// Lock order: `pending_offers` before `connections` and `early_candidates`.
struct Shared {
    connections: Mutex<HashMap<String, Arc<MediaConnection>>>,
    pending_offers: Mutex<HashMap<String, PendingOffer>>,
    early_candidates: Mutex<HashMap<String, EarlyCandidates>>,
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
}

impl Shared {
    fn new(incoming_tx: mpsc::UnboundedSender<IncomingCall>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            pending_offers: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            incoming_tx,
        }
    }

    fn connection(&self, connection_id: &str) -> Option<Arc<MediaConnection>> {
        self.connections.lock().get(connection_id).cloned()
    }

    /// Stores an offer together with any candidates that beat it here
    fn store_offer(&self, connection_id: String, src: String, sdp: String) {
        let mut pending = self.pending_offers.lock();
        let candidates = self
            .early_candidates
            .lock()
            .remove(&connection_id)
            .map(|early| early.candidates)
            .unwrap_or_default();
        pending.insert(connection_id, PendingOffer { src, sdp, candidates });
    }

    /// Returns the connection a candidate belongs to, or keeps the candidate
    /// until that connection exists
    fn route_candidate(
        &self,
        src: &str,
        connection_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Option<(Arc<MediaConnection>, RTCIceCandidateInit)> {
        let mut pending = self.pending_offers.lock();
        if let Some(conn) = self.connection(connection_id) {
            return Some((conn, candidate));
        }

        match pending.get_mut(connection_id) {
            Some(offer) => offer.candidates.push(candidate),
            None => {
                tracing::debug!("Holding candidate for call {} until its offer", connection_id);
                self.early_candidates
                    .lock()
                    .entry(connection_id.to_string())
                    .or_insert_with(|| EarlyCandidates {
                        src: src.to_string(),
                        candidates: Vec::new(),
                    })
                    .candidates
                    .push(candidate);
            }
        }
        None
    }

    /// Swaps a pending offer for its connection in one step, so later
    /// candidates go straight to the connection
    fn adopt_offer(&self, connection_id: &str, conn: &Arc<MediaConnection>) -> Option<PendingOffer> {
        let mut pending = self.pending_offers.lock();
        let offer = pending.remove(connection_id)?;
        self.connections
            .lock()
            .insert(connection_id.to_string(), Arc::clone(conn));
        Some(offer)
    }

    async fn close_peer(&self, src: &str) {
        let closing: Vec<Arc<MediaConnection>> = {
            let mut connections = self.connections.lock();
            let ids: Vec<String> = connections
                .values()
                .filter(|c| c.peer() == src)
                .map(|c| c.id().to_string())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        self.pending_offers.lock().retain(|_, offer| offer.src != src);
        self.early_candidates.lock().retain(|_, early| early.src != src);

        for conn in closing {
            conn.close().await;
        }
    }
}

pub struct RtcPeer {
    config: PeerServerConfig,
    ice_servers: Vec<RTCIceServer>,
    shared: Arc<Shared>,
    client: RwLock<Option<Arc<PeerServerClient>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingCall>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl RtcPeer {
    pub fn new(config: PeerServerConfig, ice_servers: &[IceServerConfig]) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Self {
            config,
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            shared: Arc::new(Shared::new(incoming_tx)),
            client: RwLock::new(None),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            dispatcher: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Result<Arc<PeerServerClient>, PeerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        self.client.read().clone().ok_or(PeerError::NotRegistered)
    }

    /// Drops the connection from the table once its call closes
    fn reap_on_close(&self, call: &MediaCall) {
        let shared = Arc::downgrade(&self.shared);
        let closed = call.closed();
        let connection_id = call.connection_id().to_string();

        tokio::spawn(async move {
            closed.await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let conn = shared.connections.lock().remove(&connection_id);
            if let Some(conn) = conn {
                conn.close().await;
            }
        });
    }

    async fn dispatch(shared: Arc<Shared>, mut events: broadcast::Receiver<SignalingEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dispatcher lagged, {} signaling events lost", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                SignalingEvent::Offer { src, payload } => {
                    if payload.connection_type != ConnectionType::Media {
                        tracing::debug!("Ignoring data connection offer from {}", src);
                        shared.early_candidates.lock().remove(&payload.connection_id);
                        continue;
                    }
                    tracing::info!("Incoming call {} from {}", payload.connection_id, src);

                    shared.store_offer(payload.connection_id.clone(), src.clone(), payload.sdp.sdp);
                    let _ = shared.incoming_tx.send(IncomingCall {
                        connection_id: payload.connection_id,
                        peer: src,
                        metadata: payload.metadata,
                    });
                }
                SignalingEvent::Answer { src, payload } => {
                    let Some(conn) = shared.connection(&payload.connection_id) else {
                        tracing::warn!("Answer from {} for unknown call {}", src, payload.connection_id);
                        continue;
                    };
                    if let Err(e) = conn.set_answer(payload.sdp.sdp).await {
                        tracing::error!("Failed to apply answer from {}: {}", src, e);
                        conn.close().await;
                    }
                }
                SignalingEvent::Candidate { src, payload } => {
                    let candidate = from_ice_candidate(payload.candidate);
                    if let Some((conn, candidate)) =
                        shared.route_candidate(&src, &payload.connection_id, candidate)
                    {
                        if let Err(e) = conn.add_candidate(candidate).await {
                            tracing::warn!("Bad ICE candidate from {}: {}", src, e);
                        }
                    }
                }
                SignalingEvent::Leave { src } | SignalingEvent::Expire { src } => {
                    tracing::info!("Peer {} left", src);
                    shared.close_peer(&src).await;
                }
                SignalingEvent::Error { message } => {
                    tracing::warn!("Signaling server error: {}", message);
                }
                SignalingEvent::Disconnected => {
                    // Established media keeps flowing without the server
                    tracing::warn!("Lost connection to the signaling server");
                }
                SignalingEvent::Open { .. } => {}
            }
        }
    }
}

#[async_trait]
impl PeerService for RtcPeer {
    async fn register(&self) -> Result<String, PeerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        if self.client.read().is_some() {
            return Err(PeerError::AlreadyRegistered);
        }

        let mut client = PeerServerClient::new(self.config.clone());
        let id = match &self.config.peer_id {
            Some(id) => id.clone(),
            None => client.fetch_id().await?,
        };

        let events = client.subscribe();
        let id = client.connect(id).await?;

        if self.destroyed.load(Ordering::SeqCst) {
            client.disconnect();
            return Err(PeerError::Destroyed);
        }

        let client = Arc::new(client);
        client.start_heartbeat();

        let dispatcher = tokio::spawn(Self::dispatch(Arc::clone(&self.shared), events));
        *self.dispatcher.lock() = Some(dispatcher);
        *self.client.write() = Some(client);

        tracing::info!("Registered with peer server as {}", id);
        Ok(id)
    }

    fn identity(&self) -> Option<String> {
        self.client.read().as_ref().and_then(|c| c.peer_id())
    }

    fn incoming_calls(&self) -> Option<mpsc::UnboundedReceiver<IncomingCall>> {
        self.incoming_rx.lock().take()
    }

    async fn call(&self, remote: &str, stream: MediaStream) -> Result<MediaCall, PeerError> {
        let client = self.client()?;
        let connection_id = media_connection_id();
        let (call, link) = MediaCall::new(connection_id.clone(), remote, CallDirection::Outbound);

        let conn = MediaConnection::new(
            self.ice_servers.clone(),
            connection_id.clone(),
            remote.to_string(),
            CallDirection::Outbound,
            Arc::new(link),
            Arc::clone(&client),
        )
        .await?;

        let sdp = match async {
            conn.attach_local(&stream).await?;
            conn.create_offer().await
        }
        .await
        {
            Ok(sdp) => sdp,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        self.shared
            .connections
            .lock()
            .insert(connection_id.clone(), Arc::clone(&conn));
        self.reap_on_close(&call);

        if let Err(e) = client
            .send_offer(remote.to_string(), OfferPayload::media(connection_id, sdp, None))
            .await
        {
            conn.close().await;
            return Err(e.into());
        }

        tracing::info!("Calling {}", remote);
        Ok(call)
    }

    async fn answer(
        &self,
        incoming: &IncomingCall,
        stream: MediaStream,
    ) -> Result<MediaCall, PeerError> {
        let client = self.client()?;
        let (src, sdp) = self
            .shared
            .pending_offers
            .lock()
            .get(&incoming.connection_id)
            .map(|offer| (offer.src.clone(), offer.sdp.clone()))
            .ok_or_else(|| PeerError::UnknownCall(incoming.connection_id.clone()))?;

        let (call, link) = MediaCall::new(
            incoming.connection_id.clone(),
            src.clone(),
            CallDirection::Inbound,
        );

        let conn = MediaConnection::new(
            self.ice_servers.clone(),
            incoming.connection_id.clone(),
            src.clone(),
            CallDirection::Inbound,
            Arc::new(link),
            Arc::clone(&client),
        )
        .await?;

        // Candidates from here on are held by the connection itself
        let Some(offer) = self.shared.adopt_offer(&incoming.connection_id, &conn) else {
            conn.close().await;
            return Err(PeerError::CallClosed);
        };
        self.reap_on_close(&call);

        let answer = match conn.accept_offer(sdp, &stream).await {
            Ok(answer) => answer,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        for candidate in offer.candidates {
            if let Err(e) = conn.add_candidate(candidate).await {
                tracing::warn!("Bad early ICE candidate from {}: {}", src, e);
            }
        }

        if let Err(e) = client
            .send_answer(
                src.clone(),
                AnswerPayload::media(incoming.connection_id.clone(), answer),
            )
            .await
        {
            conn.close().await;
            return Err(e.into());
        }

        tracing::info!("Answered call from {}", src);
        Ok(call)
    }

    fn decline(&self, incoming: &IncomingCall) {
        if self
            .shared
            .pending_offers
            .lock()
            .remove(&incoming.connection_id)
            .is_some()
        {
            tracing::debug!("Declined call {}", incoming.connection_id);
        }
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }

        let connections: Vec<Arc<MediaConnection>> =
            self.shared.connections.lock().drain().map(|(_, c)| c).collect();
        self.shared.pending_offers.lock().clear();
        self.shared.early_candidates.lock().clear();

        let client = self.client.write().take();
        for conn in connections {
            if let Some(client) = &client {
                let _ = client.try_send(ClientMessage::Leave {
                    dst: conn.peer().to_string(),
                });
            }
            conn.close().await;
        }

        if let Some(client) = client {
            client.disconnect();
        }
        tracing::info!("Peer destroyed");
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ice_servers;
    use crate::signaling::{CandidatePayload, IceCandidate};
    use std::time::Duration;

    fn offer_event(src: &str, connection_id: &str) -> SignalingEvent {
        SignalingEvent::Offer {
            src: src.to_string(),
            payload: OfferPayload::media(connection_id.to_string(), "v=0".to_string(), None),
        }
    }

    fn candidate_event(src: &str, connection_id: &str) -> SignalingEvent {
        SignalingEvent::Candidate {
            src: src.to_string(),
            payload: CandidatePayload::media(
                connection_id.to_string(),
                IceCandidate {
                    candidate: "candidate:1 1 udp 2130706431 192.168.1.2 54321 typ host"
                        .to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                    username_fragment: None,
                },
            ),
        }
    }

    struct Dispatcher {
        shared: Arc<Shared>,
        events: broadcast::Sender<SignalingEvent>,
        incoming: mpsc::UnboundedReceiver<IncomingCall>,
        task: JoinHandle<()>,
    }

    impl Dispatcher {
        fn spawn() -> Self {
            let (incoming_tx, incoming) = mpsc::unbounded_channel();
            let shared = Arc::new(Shared::new(incoming_tx));
            let (events, events_rx) = broadcast::channel(16);
            let task = tokio::spawn(RtcPeer::dispatch(Arc::clone(&shared), events_rx));
            Self {
                shared,
                events,
                incoming,
                task,
            }
        }

        fn pending_candidates(&self, connection_id: &str) -> Option<usize> {
            self.shared
                .pending_offers
                .lock()
                .get(connection_id)
                .map(|offer| offer.candidates.len())
        }
    }

    impl Drop for Dispatcher {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_kept() {
        let mut d = Dispatcher::spawn();

        d.events.send(candidate_event("alice", "mc_x")).unwrap();
        d.events.send(offer_event("alice", "mc_x")).unwrap();

        let incoming = d.incoming.recv().await.unwrap();
        assert_eq!(incoming.connection_id, "mc_x");
        assert_eq!(incoming.peer, "alice");
        assert_eq!(d.pending_candidates("mc_x"), Some(1));
        assert!(d.shared.early_candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_candidate_during_answer_reaches_connection() {
        let mut d = Dispatcher::spawn();
        d.events.send(offer_event("alice", "mc_x")).unwrap();
        d.incoming.recv().await.unwrap();

        let (_call, link) = MediaCall::new("mc_x", "alice", CallDirection::Inbound);
        let conn = MediaConnection::new(
            Vec::new(),
            "mc_x".to_string(),
            "alice".to_string(),
            CallDirection::Inbound,
            Arc::new(link),
            Arc::new(PeerServerClient::new(PeerServerConfig::default())),
        )
        .await
        .unwrap();

        // Connection is being set up, the offer still collects candidates
        d.events.send(candidate_event("alice", "mc_x")).unwrap();
        eventually(|| d.pending_candidates("mc_x") == Some(1)).await;

        let offer = d.shared.adopt_offer("mc_x", &conn).unwrap();
        assert_eq!(offer.candidates.len(), 1);
        assert!(d.shared.connection("mc_x").is_some());

        // No remote description yet, so the connection holds on to it
        d.events.send(candidate_event("alice", "mc_x")).unwrap();
        eventually(|| conn.buffered_candidates() == 1).await;
        assert!(d.shared.early_candidates.lock().is_empty());

        conn.close().await;
    }

    #[tokio::test]
    async fn test_leave_drops_held_candidates() {
        let d = Dispatcher::spawn();

        d.events.send(candidate_event("alice", "mc_x")).unwrap();
        eventually(|| d.shared.early_candidates.lock().contains_key("mc_x")).await;

        d.events
            .send(SignalingEvent::Leave {
                src: "alice".to_string(),
            })
            .unwrap();
        eventually(|| d.shared.early_candidates.lock().is_empty()).await;
    }

    #[tokio::test]
    async fn test_declined_offer_is_forgotten() {
        let peer = RtcPeer::new(PeerServerConfig::default(), &[]);
        peer.shared
            .store_offer("mc_x".to_string(), "alice".to_string(), "v=0".to_string());

        peer.decline(&IncomingCall {
            connection_id: "mc_x".to_string(),
            peer: "alice".to_string(),
            metadata: None,
        });
        assert!(peer.shared.pending_offers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_peer_rejects_calls() {
        let peer = RtcPeer::new(PeerServerConfig::default(), &default_ice_servers());

        assert!(peer.identity().is_none());
        assert!(matches!(
            peer.call("bob", MediaStream::new(vec![])).await,
            Err(PeerError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_answer_unknown_offer() {
        let peer = RtcPeer::new(PeerServerConfig::default(), &[]);
        *peer.client.write() = Some(Arc::new(PeerServerClient::new(PeerServerConfig::default())));

        let incoming = IncomingCall {
            connection_id: "mc_missing".to_string(),
            peer: "alice".to_string(),
            metadata: None,
        };
        assert!(matches!(
            peer.answer(&incoming, MediaStream::new(vec![])).await,
            Err(PeerError::UnknownCall(id)) if id == "mc_missing"
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_terminal() {
        let peer = RtcPeer::new(PeerServerConfig::default(), &[]);
        peer.destroy().await;
        peer.destroy().await;

        assert!(matches!(peer.register().await, Err(PeerError::Destroyed)));
        assert!(peer.incoming_calls().is_some());
        assert!(peer.incoming_calls().is_none());
    }
}
