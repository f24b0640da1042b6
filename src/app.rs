//! Application wiring
//!
//! Builds devices, surfaces, the peer service and the call session from an
//! [`AppConfig`] and exposes a snapshot of what a front end would show.

use crate::bookkeeping::{Bookkeeper, BookkeepingError, HttpBookkeeper};
use crate::config::AppConfig;
use crate::media::{FileDevices, MediaController, MediaDevices, MediaError, SurfaceStats, VideoSurface};
use crate::peer::{PeerService, RtcPeer};
use crate::session::{CallSession, SessionError, SessionState};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bookkeeping setup failed: {0}")]
    Bookkeeping(#[from] BookkeepingError),
}

/// What the single view shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppView {
    pub identity: Option<String>,
    pub state: SessionState,
    pub has_local_media: bool,
    pub local: SurfaceStats,
    pub remote: SurfaceStats,
}

/// Outcome of [`App::launch`]; both steps run concurrently
#[derive(Debug)]
pub struct Launch {
    pub media: Result<(), MediaError>,
    pub session: Result<String, SessionError>,
}

pub struct App {
    media: Arc<MediaController>,
    session: CallSession,
    local_view: Arc<VideoSurface>,
    remote_view: Arc<VideoSurface>,
}

impl App {
    /// File-backed devices and a PeerJS/WebRTC peer
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let devices: Arc<dyn MediaDevices> = Arc::new(FileDevices::new(config.media.clone()));
        let peer: Arc<dyn PeerService> =
            Arc::new(RtcPeer::new(config.peer_server.clone(), &config.ice_servers));

        let bookkeeper: Option<Arc<dyn Bookkeeper>> = match &config.bookkeeping {
            Some(bookkeeping) => Some(Arc::new(HttpBookkeeper::new(bookkeeping)?)),
            None => None,
        };

        Ok(Self::build(devices, peer, bookkeeper))
    }

    pub fn build(
        devices: Arc<dyn MediaDevices>,
        peer: Arc<dyn PeerService>,
        bookkeeper: Option<Arc<dyn Bookkeeper>>,
    ) -> Self {
        let local_view = Arc::new(VideoSurface::muted("local"));
        let remote_view = Arc::new(VideoSurface::new("remote"));

        let media = Arc::new(MediaController::new(devices, local_view.clone()));
        let session = match bookkeeper {
            Some(bookkeeper) => {
                CallSession::with_bookkeeper(peer, Arc::clone(&media), remote_view.clone(), bookkeeper)
            }
            None => CallSession::new(peer, Arc::clone(&media), remote_view.clone()),
        };

        Self {
            media,
            session,
            local_view,
            remote_view,
        }
    }

    /// Acquires local media and registers, concurrently
    pub async fn launch(&self) -> Launch {
        let (media, session) = tokio::join!(self.media.acquire(), self.session.start());

        Launch {
            media: media.map(|_| ()),
            session,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn media(&self) -> &Arc<MediaController> {
        &self.media
    }

    pub fn view(&self) -> AppView {
        AppView {
            identity: self.session.identity(),
            state: self.session.state(),
            has_local_media: self.media.has_stream(),
            local: self.local_view.stats(),
            remote: self.remote_view.stats(),
        }
    }

    /// Hangs up, or just releases local media when no session was active
    pub async fn shutdown(&self) {
        if !self.session.hang_up().await {
            self.media.release();
            self.media.clear_preview();
        }
    }
}
