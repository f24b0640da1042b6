//! Media streams and tracks
//!
//! A [`MediaStream`] is a shared handle: clones point at the same set of
//! tracks, and stopping it stops every track for every holder. Tracks carry
//! already-encoded samples over a broadcast channel so any number of
//! consumers (preview surface, outgoing RTP pump) can tap the same source.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Buffered samples per track before slow consumers start lagging
pub const SAMPLE_CHANNEL_CAPACITY: usize = 256;

const TRACK_ADDED_CAPACITY: usize = 16;

// ============================================================================
// SAMPLES + KINDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One encoded media unit (a video frame, an Opus page, an RTP payload)
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    mime_type: String,
    samples: broadcast::Sender<MediaSample>,
    ended: watch::Sender<bool>,
}

/// A single live audio or video source
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label, mime_type)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        let (ended, _) = watch::channel(false);

        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                mime_type: mime_type.into(),
                samples,
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Codec of the samples, e.g. `video/VP8`
    pub fn mime_type(&self) -> &str {
        &self.inner.mime_type
    }

    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    /// Ends the track. Returns `false` if it had already ended.
    pub fn stop(&self) -> bool {
        self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }

    /// Resolves once the track has ended
    pub fn ended(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.ended.subscribe();
        async move {
            let _ = rx.wait_for(|ended| *ended).await;
        }
    }

    /// Publishes a sample to every consumer; dropped once the track ended
    pub fn push(&self, sample: MediaSample) -> bool {
        if !self.is_live() {
            return false;
        }
        // No subscribers is fine, the sample is simply not observed
        let _ = self.inner.samples.send(sample);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("mime_type", &self.inner.mime_type)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
    added: broadcast::Sender<MediaTrack>,
}

/// Bundle of tracks, either captured locally or received from a peer
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        let (added, _) = broadcast::channel(TRACK_ADDED_CAPACITY);
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
                added,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.inner.tracks.read().iter().any(|t| t.kind() == kind)
    }

    /// Adds a track unless one with the same id is already present
    pub fn add_track(&self, track: MediaTrack) -> bool {
        {
            let mut tracks = self.inner.tracks.write();
            if tracks.iter().any(|t| t.id() == track.id()) {
                return false;
            }
            tracks.push(track.clone());
        }
        let _ = self.inner.added.send(track);
        true
    }

    /// Notifies about tracks added after the call
    pub fn subscribe_tracks(&self) -> broadcast::Receiver<MediaTrack> {
        self.inner.added.subscribe()
    }

    /// `true` while at least one track is live
    pub fn is_active(&self) -> bool {
        self.inner.tracks.read().iter().any(MediaTrack::is_live)
    }

    /// Stops every track and returns how many were still live
    pub fn stop(&self) -> usize {
        self.tracks().iter().filter(|t| t.stop()).count()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaStream {}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> MediaSample {
        MediaSample {
            data: Bytes::from(vec![0u8; len]),
            duration: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_stop_is_reported_once() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic", "audio/opus"),
            MediaTrack::new(TrackKind::Video, "cam", "video/VP8"),
        ]);

        assert!(stream.is_active());
        assert_eq!(stream.stop(), 2);
        assert!(!stream.is_active());
        assert_eq!(stream.stop(), 0);
    }

    #[test]
    fn test_clones_share_tracks() {
        let stream = MediaStream::new(vec![]);
        let clone = stream.clone();
        clone.add_track(MediaTrack::new(TrackKind::Video, "cam", "video/VP8"));
        assert!(stream.has_kind(TrackKind::Video));
        assert_eq!(stream, clone);
    }

    #[test]
    fn test_duplicate_track_is_not_added() {
        let track = MediaTrack::new(TrackKind::Audio, "mic", "audio/opus");
        let stream = MediaStream::new(vec![track.clone()]);
        assert!(!stream.add_track(track));
        assert_eq!(stream.tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_samples_stop_after_end() {
        let track = MediaTrack::new(TrackKind::Audio, "mic", "audio/opus");
        let mut rx = track.subscribe();

        assert!(track.push(sample(4)));
        assert_eq!(rx.recv().await.unwrap().data.len(), 4);

        track.stop();
        assert!(!track.push(sample(4)));
        track.ended().await;
    }

    #[tokio::test]
    async fn test_added_tracks_are_announced() {
        let stream = MediaStream::new(vec![]);
        let mut added = stream.subscribe_tracks();
        let track = MediaTrack::new(TrackKind::Video, "remote", "video/VP8");
        stream.add_track(track.clone());
        assert_eq!(added.recv().await.unwrap(), track);
    }
}
