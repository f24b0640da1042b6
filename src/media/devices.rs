//! Capture devices
//!
//! [`MediaDevices`] is the seam to whatever produces local media. The
//! shipped implementation, [`FileDevices`], replays an IVF video file and an
//! Ogg/Opus audio file in real time, the same way a camera and microphone
//! would deliver encoded frames.

use super::stream::{MediaSample, MediaStream, MediaTrack, TrackKind};
use crate::config::MediaConfig;
use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};
use webrtc::media::io::ogg_reader::OggReader;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Opus always runs on a 48 kHz clock
const OPUS_CLOCK_RATE: u64 = 48_000;

/// Ogg page cadence used when the granule position does not move
const OGG_PAGE_DURATION: Duration = Duration::from_millis(20);

const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Permission to capture media was denied")]
    PermissionDenied,

    #[error("No {0} capture device available")]
    NotFound(TrackKind),

    #[error("At least one of audio or video must be requested")]
    EmptyConstraints,

    #[error("Invalid media source {path:?}: {message}")]
    InvalidSource { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Which kinds of media a capture request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::AUDIO_VIDEO
    }
}

// ============================================================================
// DEVICE CAPABILITY
// ============================================================================

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Opens every requested kind or fails as a whole
    async fn get_user_media(&self, constraints: MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

// ============================================================================
// FILE DEVICES
// ============================================================================

/// Capture devices backed by media files
#[derive(Debug, Clone)]
pub struct FileDevices {
    config: MediaConfig,
}

impl FileDevices {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    fn open_video(&self) -> Result<MediaTrack, MediaError> {
        let path = self
            .config
            .video_file
            .as_ref()
            .ok_or(MediaError::NotFound(TrackKind::Video))?;

        let (_, header) = open_ivf(path)?;
        let mime_type = match &header.four_cc {
            b"VP80" => MIME_TYPE_VP8,
            b"VP90" => MIME_TYPE_VP9,
            other => {
                return Err(MediaError::InvalidSource {
                    path: path.clone(),
                    message: format!("unsupported codec {:?}", String::from_utf8_lossy(other)),
                })
            }
        };

        let track = MediaTrack::new(TrackKind::Video, label_for(path), mime_type);
        tokio::spawn(pump_ivf(path.clone(), track.clone(), self.config.looping));
        Ok(track)
    }

    fn open_audio(&self) -> Result<MediaTrack, MediaError> {
        let path = self
            .config
            .audio_file
            .as_ref()
            .ok_or(MediaError::NotFound(TrackKind::Audio))?;

        open_ogg(path)?;

        let track = MediaTrack::new(TrackKind::Audio, label_for(path), MIME_TYPE_OPUS);
        tokio::spawn(pump_ogg(path.clone(), track.clone(), self.config.looping));
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for FileDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if constraints.is_empty() {
            return Err(MediaError::EmptyConstraints);
        }
        if self.config.deny {
            return Err(MediaError::PermissionDenied);
        }

        let mut tracks = Vec::new();

        if constraints.audio {
            tracks.push(self.open_audio()?);
        }

        if constraints.video {
            match self.open_video() {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    // Partial success would leave a dangling audio pump
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Opened file capture with {} track(s): {:?}",
            tracks.len(),
            tracks.iter().map(|t| t.kind()).collect::<Vec<_>>()
        );

        Ok(MediaStream::new(tracks))
    }
}

fn label_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn open_ivf(path: &Path) -> Result<(IVFReader<BufReader<File>>, IVFFileHeader), MediaError> {
    let file = File::open(path)?;
    IVFReader::new(BufReader::new(file)).map_err(|e| MediaError::InvalidSource {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn open_ogg(path: &Path) -> Result<OggReader<BufReader<File>>, MediaError> {
    let file = File::open(path)?;
    OggReader::new(BufReader::new(file), true)
        .map(|(reader, _)| reader)
        .map_err(|e| MediaError::InvalidSource {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn frame_duration(header: &IVFFileHeader) -> Duration {
    if header.timebase_denominator == 0 || header.timebase_numerator == 0 {
        return DEFAULT_FRAME_DURATION;
    }
    Duration::from_secs_f64(header.timebase_numerator as f64 / header.timebase_denominator as f64)
}

/// Replays IVF frames at the file's frame rate until the track stops
async fn pump_ivf(path: PathBuf, track: MediaTrack, looping: bool) {
    let mut frames: u64 = 0;

    loop {
        let (mut reader, header) = match open_ivf(&path) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!("Video source {:?} became unreadable: {}", path, e);
                track.stop();
                return;
            }
        };

        let duration = frame_duration(&header);
        let mut ticker = tokio::time::interval(duration);

        loop {
            tokio::select! {
                _ = track.ended() => {
                    tracing::debug!("Video pump for {:?} stopped after {} frames", path, frames);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match reader.parse_next_frame() {
                Ok((frame, _)) => {
                    frames += 1;
                    track.push(MediaSample {
                        data: frame.freeze(),
                        duration,
                    });
                }
                Err(_) => break,
            }
        }

        if !looping {
            tracing::debug!("Video source {:?} exhausted after {} frames", path, frames);
            track.stop();
            return;
        }
    }
}

/// Replays Ogg pages paced by their granule positions
async fn pump_ogg(path: PathBuf, track: MediaTrack, looping: bool) {
    let mut pages: u64 = 0;

    loop {
        let mut reader = match open_ogg(&path) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!("Audio source {:?} became unreadable: {}", path, e);
                track.stop();
                return;
            }
        };

        let mut ticker = tokio::time::interval(OGG_PAGE_DURATION);
        let mut last_granule: u64 = 0;

        loop {
            tokio::select! {
                _ = track.ended() => {
                    tracing::debug!("Audio pump for {:?} stopped after {} pages", path, pages);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match reader.parse_next_page() {
                Ok((page, header)) => {
                    let sample_count = header.granule_position.saturating_sub(last_granule);
                    last_granule = header.granule_position;

                    let duration = if sample_count == 0 {
                        OGG_PAGE_DURATION
                    } else {
                        Duration::from_millis(sample_count * 1000 / OPUS_CLOCK_RATE)
                    };

                    pages += 1;
                    track.push(MediaSample {
                        data: page.freeze(),
                        duration,
                    });
                }
                Err(_) => break,
            }
        }

        if !looping {
            tracing::debug!("Audio source {:?} exhausted after {} pages", path, pages);
            track.stop();
            return;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
