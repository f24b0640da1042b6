//! Media Controller
//!
//! Owns the single local capture stream and its preview binding.

use super::devices::{MediaConstraints, MediaDevices, MediaError};
use super::stream::MediaStream;
use super::surface::DisplayTarget;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    preview: Arc<dyn DisplayTarget>,
    constraints: MediaConstraints,
    stream: Mutex<Option<MediaStream>>,
}

impl MediaController {
    /// Controller requesting audio and video
    pub fn new(devices: Arc<dyn MediaDevices>, preview: Arc<dyn DisplayTarget>) -> Self {
        Self::with_constraints(devices, preview, MediaConstraints::AUDIO_VIDEO)
    }

    pub fn with_constraints(
        devices: Arc<dyn MediaDevices>,
        preview: Arc<dyn DisplayTarget>,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            devices,
            preview,
            constraints,
            stream: Mutex::new(None),
        }
    }

    /// Requests capture once and binds the result to the preview
    ///
    /// Failures are logged and returned; nothing is retried. An already held
    /// stream is returned as is.
    pub async fn acquire(&self) -> Result<MediaStream, MediaError> {
        if let Some(stream) = self.current() {
            tracing::debug!("Local stream {} already acquired", stream.id());
            return Ok(stream);
        }

        let stream = match self.devices.get_user_media(self.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Error accessing media devices: {}", e);
                return Err(e);
            }
        };

        {
            let mut slot = self.stream.lock();
            if let Some(existing) = slot.as_ref() {
                // A concurrent acquire won; keep a single open stream
                stream.stop();
                return Ok(existing.clone());
            }
            *slot = Some(stream.clone());
        }

        tracing::info!(
            "Acquired local stream {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );

        self.preview.set_source(Some(stream.clone()));
        if let Err(e) = self.preview.play().await {
            tracing::warn!("Failed to play local preview: {}", e);
        }

        Ok(stream)
    }

    /// Stops every track of the held stream; `false` when nothing was held
    pub fn release(&self) -> bool {
        match self.stream.lock().take() {
            Some(stream) => {
                let stopped = stream.stop();
                tracing::info!("Released local stream {} ({} tracks stopped)", stream.id(), stopped);
                true
            }
            None => {
                tracing::debug!("No local stream to release");
                false
            }
        }
    }

    pub fn current(&self) -> Option<MediaStream> {
        self.stream.lock().clone()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub fn preview(&self) -> &Arc<dyn DisplayTarget> {
        &self.preview
    }

    pub fn clear_preview(&self) {
        self.preview.set_source(None);
    }
}

impl std::fmt::Debug for MediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaController")
            .field("constraints", &self.constraints)
            .field("stream", &*self.stream.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::stream::{MediaTrack, TrackKind};
    use crate::media::surface::VideoSurface;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDevices {
        grant: bool,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl MediaDevices for StubDevices {
        async fn get_user_media(
            &self,
            _constraints: MediaConstraints,
        ) -> Result<MediaStream, MediaError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.grant {
                Ok(MediaStream::new(vec![
                    MediaTrack::new(TrackKind::Audio, "mic", "audio/opus"),
                    MediaTrack::new(TrackKind::Video, "cam", "video/VP8"),
                ]))
            } else {
                Err(MediaError::PermissionDenied)
            }
        }
    }

    fn controller(grant: bool) -> (MediaController, Arc<StubDevices>, Arc<VideoSurface>) {
        let devices = Arc::new(StubDevices {
            grant,
            requests: AtomicUsize::new(0),
        });
        let preview = Arc::new(VideoSurface::muted("local"));
        let controller = MediaController::new(devices.clone(), preview.clone());
        (controller, devices, preview)
    }

    #[tokio::test]
    async fn test_acquire_binds_preview() {
        let (controller, _, preview) = controller(true);
        let stream = controller.acquire().await.unwrap();

        assert_eq!(preview.source(), Some(stream.clone()));
        assert_eq!(controller.current(), Some(stream));
        assert!(preview.is_playing());
    }

    #[tokio::test]
    async fn test_denied_leaves_stream_unset() {
        let (controller, _, preview) = controller(false);
        assert!(matches!(
            controller.acquire().await,
            Err(MediaError::PermissionDenied)
        ));
        assert!(!controller.has_stream());
        assert!(preview.source().is_none());
    }

    #[tokio::test]
    async fn test_second_acquire_reuses_stream() {
        let (controller, devices, _) = controller(true);
        let first = controller.acquire().await.unwrap();
        let second = controller.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(devices.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (controller, _, _) = controller(true);
        let stream = controller.acquire().await.unwrap();

        assert!(controller.release());
        assert!(!stream.is_active());
        assert!(controller.current().is_none());
        assert!(!controller.release());
    }
}
