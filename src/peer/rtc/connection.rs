//! One WebRTC peer connection per media call
//!
//! Local tracks are written through `TrackLocalStaticSample`, remote tracks
//! are read as RTP and their payloads pushed into a [`MediaStream`].

use crate::media::{MediaSample, MediaStream, MediaTrack, TrackKind};
use crate::peer::{CallDirection, CallLink, PeerError};
use crate::signaling::{CandidatePayload, IceCandidate, PeerServerClient};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn rtc_error(e: impl std::fmt::Display) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

pub(crate) struct MediaConnection {
    id: String,
    peer: String,
    direction: CallDirection,
    pc: Arc<RTCPeerConnection>,
    link: Arc<CallLink>,
    remote_stream: Arc<Mutex<Option<MediaStream>>>,
    /// Candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MediaConnection {
    pub async fn new(
        ice_servers: Vec<RTCIceServer>,
        id: String,
        peer: String,
        direction: CallDirection,
        link: Arc<CallLink>,
        signal: Arc<PeerServerClient>,
    ) -> Result<Arc<Self>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // RTCP, NACK, reports
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_error)?);

        let conn = Arc::new(Self {
            id,
            peer,
            direction,
            pc,
            link,
            remote_stream: Arc::new(Mutex::new(None)),
            pending_candidates: Mutex::new(Vec::new()),
            pumps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        conn.setup_handlers(signal);
        Ok(conn)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends every local track; the offerer also asks for the kinds it lacks
    pub async fn attach_local(&self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in stream.tracks() {
            self.add_local_track(stream.id(), track).await?;
        }

        if self.direction == CallDirection::Outbound {
            for (kind, codec) in [
                (TrackKind::Audio, RTPCodecType::Audio),
                (TrackKind::Video, RTPCodecType::Video),
            ] {
                if !stream.has_kind(kind) {
                    self.pc
                        .add_transceiver_from_kind(
                            codec,
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Recvonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await
                        .map_err(rtc_error)?;
                }
            }
        }

        Ok(())
    }

    pub async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    /// Applies the caller's offer and returns our answer
    pub async fn accept_offer(
        &self,
        offer_sdp: String,
        stream: &MediaStream,
    ) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc.set_remote_description(offer).await.map_err(rtc_error)?;

        self.attach_local(stream).await?;
        self.flush_candidates().await;

        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(answer.sdp)
    }

    pub async fn set_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc.set_remote_description(answer).await.map_err(rtc_error)?;
        self.flush_candidates().await;
        Ok(())
    }

    pub async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError> {
        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.lock().push(candidate);
            // The description may have landed, and flushed, meanwhile
            if self.pc.remote_description().await.is_some() {
                self.flush_candidates().await;
            }
            return Ok(());
        }
        self.pc.add_ice_candidate(candidate).await.map_err(rtc_error)
    }

    #[cfg(test)]
    pub(crate) fn buffered_candidates(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    /// Stops pumps, ends remote tracks and closes the peer connection
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.link.close();
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        if let Some(stream) = self.remote_stream.lock().take() {
            stream.stop();
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Closing peer connection {}: {}", self.id, e);
        }
        tracing::info!("Media connection {} with {} closed", self.id, self.peer);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn flush_candidates(&self) {
        let pending: Vec<_> = self.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Dropping buffered ICE candidate: {}", e);
            }
        }
    }

    async fn add_local_track(&self, stream_id: &str, track: MediaTrack) -> Result<(), PeerError> {
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: track.mime_type().to_string(),
                ..Default::default()
            },
            track.id().to_string(),
            stream_id.to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;

        // RTCP has to be read for the interceptors to work
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let pump = tokio::spawn(pump_local(track, rtc_track));

        let mut pumps = self.pumps.lock();
        pumps.push(rtcp);
        pumps.push(pump);
        Ok(())
    }

    fn setup_handlers(self: &Arc<Self>, signal: Arc<PeerServerClient>) {
        // Connection state
        let link = Arc::clone(&self.link);
        let id = self.id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection {} state: {:?}", id, s);

                match s {
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => link.close(),
                    _ => {}
                }

                Box::pin(async {})
            }));

        // Trickle ICE to the far end
        let id = self.id.clone();
        let peer = self.peer.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let signal = Arc::clone(&signal);
            let id = id.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = CandidatePayload::media(id, to_ice_candidate(init));
                        if let Err(e) = signal.send_candidate(peer, payload).await {
                            tracing::warn!("Failed to send ICE candidate: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Could not serialize ICE candidate: {}", e),
                }
            })
        }));

        // Remote media
        let link = Arc::clone(&self.link);
        let remote_stream = Arc::clone(&self.remote_stream);
        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let link = Arc::clone(&link);
            let remote_stream = Arc::clone(&remote_stream);
            let weak = weak.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                let codec = track.codec();
                tracing::info!("Received {} track: {}", kind, codec.capability.mime_type);

                let media_track = MediaTrack::with_id(
                    track.id(),
                    kind,
                    format!("remote {}", kind),
                    codec.capability.mime_type,
                );

                let (stream, first) = {
                    let mut slot = remote_stream.lock();
                    match slot.as_ref() {
                        Some(stream) => (stream.clone(), false),
                        None => {
                            let stream = MediaStream::with_id(track.stream_id(), vec![]);
                            *slot = Some(stream.clone());
                            (stream, true)
                        }
                    }
                };

                stream.add_track(media_track.clone());
                if first {
                    link.deliver(stream);
                }

                let forward = tokio::spawn(forward_remote(track, media_track));
                match weak.upgrade() {
                    Some(conn) => conn.pumps.lock().push(forward),
                    None => forward.abort(),
                }
            })
        }));
    }
}

/// Copies samples from a local track into the WebRTC sender
async fn pump_local(track: MediaTrack, rtc_track: Arc<TrackLocalStaticSample>) {
    let mut samples = track.subscribe();
    let ended = track.ended();
    tokio::pin!(ended);

    loop {
        tokio::select! {
            _ = &mut ended => break,
            received = samples.recv() => match received {
                Ok(sample) => {
                    let sample = Sample {
                        data: sample.data,
                        duration: sample.duration,
                        ..Default::default()
                    };
                    if let Err(e) = rtc_track.write_sample(&sample).await {
                        tracing::trace!("write_sample on {}: {}", track.id(), e);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Local pump for {} skipped {} samples", track.id(), n);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Copies RTP payloads from a remote track into its [`MediaTrack`]
async fn forward_remote(track: Arc<TrackRemote>, media: MediaTrack) {
    let ended = media.ended();
    tokio::pin!(ended);

    loop {
        tokio::select! {
            _ = &mut ended => break,
            packet = track.read_rtp() => match packet {
                Ok((packet, _)) => {
                    media.push(MediaSample {
                        data: packet.payload,
                        duration: Duration::ZERO,
                    });
                }
                Err(e) => {
                    tracing::debug!("Remote track {} ended: {}", media.id(), e);
                    break;
                }
            },
        }
    }

    media.stop();
}

// ============================================================================
// CONVERSIONS
// ============================================================================

pub(crate) fn to_ice_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

pub(crate) fn from_ice_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}
