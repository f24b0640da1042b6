//! Media Module - Capture, Streams, Playback
//!
//! This module covers:
//! - Local capture behind the [`MediaDevices`] capability
//! - Shared stream/track handles carrying encoded samples
//! - Playback surfaces ([`DisplayTarget`])
//! - The [`MediaController`] owning the single local stream

mod controller;
mod devices;
mod stream;
mod surface;

pub use controller::MediaController;
pub use devices::{FileDevices, MediaConstraints, MediaDevices, MediaError};
pub use stream::{MediaSample, MediaStream, MediaTrack, TrackKind, SAMPLE_CHANNEL_CAPACITY};
pub use surface::{DisplayTarget, PlaybackError, SurfaceStats, VideoSurface};
