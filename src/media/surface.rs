//! Playback surfaces
//!
//! A [`DisplayTarget`] is anything a stream can be bound to for rendering.
//! [`VideoSurface`] is a headless renderer: it drains every track of its
//! source and keeps counters, which is what the terminal front end shows.

use super::stream::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("No source attached")]
    NoSource,

    #[error("Source stream {0} has no live tracks")]
    SourceEnded(String),
}

// ============================================================================
// DISPLAY TARGET
// ============================================================================

#[async_trait]
pub trait DisplayTarget: Send + Sync {
    /// Replaces the bound source; `None` stops rendering
    fn set_source(&self, stream: Option<MediaStream>);

    fn source(&self) -> Option<MediaStream>;

    /// Starts rendering the bound source
    async fn play(&self) -> Result<(), PlaybackError>;
}

// ============================================================================
// VIDEO SURFACE
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.video_frames.store(0, Ordering::Relaxed);
        self.audio_frames.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of what a surface has rendered since its source was bound
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SurfaceStats {
    pub source_id: Option<String>,
    pub playing: bool,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Playback {
    source: Option<MediaStream>,
    render: Option<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

/// Headless surface that renders into counters
pub struct VideoSurface {
    name: String,
    /// Audio is consumed but not counted, like a muted `<video>` element
    muted: bool,
    playback: Mutex<Playback>,
    counters: Arc<Counters>,
}

impl VideoSurface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            muted: false,
            playback: Mutex::new(Playback::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Local previews are muted to avoid echoing the microphone
    pub fn muted(name: impl Into<String>) -> Self {
        let mut surface = Self::new(name);
        surface.muted = true;
        surface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_playing(&self) -> bool {
        self.playback
            .lock()
            .render
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SurfaceStats {
        let playback = self.playback.lock();
        SurfaceStats {
            source_id: playback.source.as_ref().map(|s| s.id().to_string()),
            playing: playback
                .render
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false),
            video_frames: self.counters.video_frames.load(Ordering::Relaxed),
            audio_frames: self.counters.audio_frames.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            started_at: playback.started_at,
        }
    }
}

#[async_trait]
impl DisplayTarget for VideoSurface {
    fn set_source(&self, stream: Option<MediaStream>) {
        let mut playback = self.playback.lock();

        if let Some(render) = playback.render.take() {
            render.abort();
        }
        self.counters.reset();
        playback.started_at = None;

        match &stream {
            Some(s) => tracing::debug!("Surface '{}' bound to stream {}", self.name, s.id()),
            None => tracing::debug!("Surface '{}' cleared", self.name),
        }
        playback.source = stream;
    }

    fn source(&self) -> Option<MediaStream> {
        self.playback.lock().source.clone()
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        let mut playback = self.playback.lock();

        let stream = playback.source.clone().ok_or(PlaybackError::NoSource)?;
        if !stream.is_active() {
            return Err(PlaybackError::SourceEnded(stream.id().to_string()));
        }

        if playback.render.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        playback.render = Some(tokio::spawn(render(
            stream,
            Arc::clone(&self.counters),
            self.muted,
        )));
        playback.started_at = Some(Utc::now());

        tracing::debug!("Surface '{}' playing", self.name);
        Ok(())
    }
}

impl Drop for VideoSurface {
    fn drop(&mut self) {
        if let Some(render) = self.playback.get_mut().render.take() {
            render.abort();
        }
    }
}

impl std::fmt::Debug for VideoSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSurface")
            .field("name", &self.name)
            .field("muted", &self.muted)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Consumes the current tracks and every track added later
async fn render(stream: MediaStream, counters: Arc<Counters>, muted: bool) {
    // Subscribe first so a track added while listing is not missed
    let mut added = stream.subscribe_tracks();
    let mut seen = HashSet::new();
    let mut consumers = JoinSet::new();

    for track in stream.tracks() {
        if seen.insert(track.id().to_string()) {
            consumers.spawn(consume(track, Arc::clone(&counters), muted));
        }
    }

    loop {
        tokio::select! {
            received = added.recv() => match received {
                Ok(track) => {
                    if seen.insert(track.id().to_string()) {
                        consumers.spawn(consume(track, Arc::clone(&counters), muted));
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            Some(_) = consumers.join_next(), if !consumers.is_empty() => {
                if consumers.is_empty() && !stream.is_active() {
                    break;
                }
            }
        }
    }

    while consumers.join_next().await.is_some() {}
}

async fn consume(track: MediaTrack, counters: Arc<Counters>, muted: bool) {
    let mut samples = track.subscribe();
    let ended = track.ended();
    tokio::pin!(ended);

    loop {
        tokio::select! {
            _ = &mut ended => break,
            received = samples.recv() => match received {
                Ok(sample) => {
                    match track.kind() {
                        TrackKind::Video => {
                            counters.video_frames.fetch_add(1, Ordering::Relaxed);
                        }
                        TrackKind::Audio if muted => continue,
                        TrackKind::Audio => {
                            counters.audio_frames.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    counters.bytes.fetch_add(sample.data.len() as u64, Ordering::Relaxed);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::trace!("Renderer lagged by {} samples on track {}", skipped, track.id());
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
