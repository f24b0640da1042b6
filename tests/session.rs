mod common;

use common::{
    eventually, stub_stream, wait_for_event, RecordingBookkeeper, ScriptedPeer, StubDevices,
};
use peercall::bookkeeping::{ConnectionRecord, PeerRecord};
use peercall::media::{DisplayTarget, MediaController, VideoSurface};
use peercall::session::IgnoreReason;
use peercall::{App, CallSession, SessionError, SessionEvent, SessionState};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    session: CallSession,
    media: Arc<MediaController>,
    preview: Arc<VideoSurface>,
    remote: Arc<VideoSurface>,
    peer: Arc<ScriptedPeer>,
    bookkeeper: Arc<RecordingBookkeeper>,
}

fn harness(devices: Arc<StubDevices>, peer: Arc<ScriptedPeer>) -> Harness {
    let preview = Arc::new(VideoSurface::muted("local"));
    let remote = Arc::new(VideoSurface::new("remote"));
    let bookkeeper = RecordingBookkeeper::new();
    let media = Arc::new(MediaController::new(devices, preview.clone()));
    let session = CallSession::with_bookkeeper(
        peer.clone(),
        Arc::clone(&media),
        remote.clone(),
        bookkeeper.clone(),
    );

    Harness {
        session,
        media,
        preview,
        remote,
        peer,
        bookkeeper,
    }
}

#[tokio::test]
async fn acquired_stream_is_bound_to_preview() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));

    let stream = h.media.acquire().await.unwrap();

    assert_eq!(h.preview.source(), Some(stream.clone()));
    assert!(h.preview.is_playing());

    // A second acquire keeps the single stream
    assert_eq!(h.media.acquire().await.unwrap(), stream);
}

#[tokio::test]
async fn denied_media_disables_calling() {
    let devices = StubDevices::denying();
    let h = harness(devices.clone(), ScriptedPeer::new("alice"));

    assert!(h.media.acquire().await.is_err());
    h.session.start().await.unwrap();

    assert!(h.media.current().is_none());
    assert!(h.preview.source().is_none());
    assert!(matches!(
        h.session.place_call("bob").await,
        Err(SessionError::NoLocalMedia)
    ));
    assert!(h.peer.placed().is_empty());
    assert_eq!(h.session.state(), SessionState::Ready);
    assert_eq!(devices.requests(), 1);
}

#[tokio::test]
async fn identity_is_fixed_after_registration() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));
    let mut events = h.session.subscribe();

    let identity = h.session.start().await.unwrap();
    assert!(!identity.is_empty());
    assert_eq!(h.session.identity(), Some(identity.clone()));
    assert_eq!(
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::Registered { .. })).await,
        SessionEvent::Registered {
            identity: identity.clone()
        }
    );

    assert!(matches!(h.session.start().await, Err(SessionError::AlreadyStarted)));
    h.media.acquire().await.unwrap();
    h.session.place_call("bob").await.unwrap();
    assert_eq!(h.session.identity(), Some(identity.clone()));

    eventually(|| h.bookkeeper.peers() == vec![PeerRecord { identity: identity.clone() }]).await;
}

#[tokio::test]
async fn registration_failure_terminates_session() {
    let h = harness(StubDevices::granting(), ScriptedPeer::failing());

    let result = h.session.start().await;

    assert!(matches!(result, Err(SessionError::Peer(_))));
    assert_eq!(h.session.state(), SessionState::Terminated);
    assert!(h.session.identity().is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.bookkeeper.peers().is_empty());
}

#[tokio::test]
async fn placed_call_binds_remote_stream() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));
    let mut events = h.session.subscribe();
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();

    let connection_id = h.session.place_call("X").await.unwrap();
    assert_eq!(h.peer.placed(), vec!["X".to_string()]);
    assert!(matches!(
        h.session.state(),
        SessionState::InCall { ref remote, .. } if remote == "X"
    ));

    let remote_stream = stub_stream();
    assert!(h.peer.link(&connection_id).unwrap().deliver(remote_stream.clone()));

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::RemoteStream { .. })).await;
    assert_eq!(h.remote.source(), Some(remote_stream));

    eventually(|| {
        h.bookkeeper.connections()
            == vec![ConnectionRecord {
                identity: "alice".to_string(),
                connected_to: "X".to_string(),
            }]
    })
    .await;
}

#[tokio::test]
async fn second_call_while_in_call_is_rejected() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();
    h.session.place_call("bob").await.unwrap();

    assert!(matches!(
        h.session.place_call("carol").await,
        Err(SessionError::NotReady(SessionState::InCall { .. }))
    ));
    assert_eq!(h.peer.placed(), vec!["bob".to_string()]);
}

#[tokio::test]
async fn hang_up_clears_views_and_media() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));
    let mut events = h.session.subscribe();
    let local = h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();

    let connection_id = h.session.place_call("bob").await.unwrap();
    h.peer.link(&connection_id).unwrap().deliver(stub_stream());
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::RemoteStream { .. })).await;
    assert!(h.remote.source().is_some());

    assert!(h.session.hang_up().await);

    assert_eq!(h.session.state(), SessionState::Terminated);
    assert!(h.preview.source().is_none());
    assert!(h.remote.source().is_none());
    assert!(h.media.current().is_none());
    assert!(!local.is_active());
    assert!(h.peer.is_destroyed());

    // Second hang up is a no-op
    assert!(!h.session.hang_up().await);
    assert_eq!(h.session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn hang_up_without_session_is_noop() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));

    assert!(!h.session.hang_up().await);
    assert_eq!(h.session.state(), SessionState::Uninitialized);
    assert!(!h.peer.is_destroyed());
}

#[tokio::test]
async fn inbound_call_before_media_is_ignored() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("bob"));
    let mut events = h.session.subscribe();
    h.session.start().await.unwrap();

    let offer = h.peer.offer("alice");

    assert_eq!(
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::IncomingIgnored { .. })).await,
        SessionEvent::IncomingIgnored {
            remote: "alice".to_string(),
            reason: IgnoreReason::NoLocalMedia,
        }
    );
    assert!(h.peer.answered().is_empty());
    assert_eq!(h.peer.declined(), vec![offer.connection_id]);
    assert_eq!(h.session.state(), SessionState::Ready);
    assert!(h.preview.source().is_none());
    assert!(h.remote.source().is_none());

    // Only the registration was recorded
    eventually(|| h.bookkeeper.peers().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.bookkeeper.connections().is_empty());
}

#[tokio::test]
async fn inbound_call_is_answered_with_local_stream() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("bob"));
    let mut events = h.session.subscribe();
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();

    let offer = h.peer.offer("alice");
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::CallStarted { .. })).await;
    assert_eq!(h.peer.answered(), vec![offer.connection_id.clone()]);

    let remote_stream = stub_stream();
    h.peer.link(&offer.connection_id).unwrap().deliver(remote_stream.clone());
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::RemoteStream { .. })).await;
    assert_eq!(h.remote.source(), Some(remote_stream));

    eventually(|| {
        h.bookkeeper.connections()
            == vec![ConnectionRecord {
                identity: "bob".to_string(),
                connected_to: "alice".to_string(),
            }]
    })
    .await;
}

#[tokio::test]
async fn inbound_call_while_busy_is_ignored() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("bob"));
    let mut events = h.session.subscribe();
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();
    h.session.place_call("alice").await.unwrap();

    let offer = h.peer.offer("carol");

    assert_eq!(
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::IncomingIgnored { .. })).await,
        SessionEvent::IncomingIgnored {
            remote: "carol".to_string(),
            reason: IgnoreReason::Busy,
        }
    );
    assert!(h.peer.answered().is_empty());
    assert_eq!(h.peer.declined(), vec![offer.connection_id]);
    assert!(matches!(
        h.session.state(),
        SessionState::InCall { ref remote, .. } if remote == "alice"
    ));
}

#[tokio::test]
async fn remote_closure_returns_to_ready() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));
    let mut events = h.session.subscribe();
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();

    let connection_id = h.session.place_call("bob").await.unwrap();
    let link = h.peer.link(&connection_id).unwrap();
    link.deliver(stub_stream());
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::RemoteStream { .. })).await;

    link.close();

    assert_eq!(
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::CallEnded { .. })).await,
        SessionEvent::CallEnded {
            connection_id: connection_id.clone()
        }
    );
    assert_eq!(h.session.state(), SessionState::Ready);
    assert!(h.remote.source().is_none());
    assert!(h.media.current().is_some());

    // Ready again, so a new call goes out
    h.session.place_call("carol").await.unwrap();
    assert_eq!(h.peer.placed(), vec!["bob".to_string(), "carol".to_string()]);
}

#[tokio::test]
async fn stream_arriving_after_hang_up_is_not_bound() {
    let h = harness(StubDevices::granting(), ScriptedPeer::sticky("alice"));
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();

    let connection_id = h.session.place_call("bob").await.unwrap();
    h.session.hang_up().await;

    let link = h.peer.link(&connection_id).unwrap();
    link.deliver(stub_stream());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.remote.source().is_none());
    assert_eq!(h.session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn failed_call_returns_to_ready() {
    let h = harness(StubDevices::granting(), ScriptedPeer::new("alice"));
    let mut events = h.session.subscribe();
    h.media.acquire().await.unwrap();
    h.session.start().await.unwrap();

    let connection_id = h.session.place_call("ghost").await.unwrap();
    h.peer
        .link(&connection_id)
        .unwrap()
        .fail(peercall::peer::PeerError::PeerUnavailable("ghost".to_string()));

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::CallEnded { .. })).await;
    assert_eq!(h.session.state(), SessionState::Ready);
    assert!(h.remote.source().is_none());
}

#[tokio::test]
async fn app_launch_acquires_and_registers() {
    let peer = ScriptedPeer::new("alice");
    let app = App::build(StubDevices::granting(), peer.clone(), None);

    let launch = app.launch().await;
    assert!(launch.media.is_ok());
    assert_eq!(launch.session.unwrap(), "alice");

    let view = app.view();
    assert_eq!(view.identity.as_deref(), Some("alice"));
    assert!(view.has_local_media);
    assert_eq!(
        view.local.source_id.as_deref(),
        app.media().current().as_ref().map(|s| s.id())
    );

    app.shutdown().await;
    assert!(peer.is_destroyed());
    assert!(!app.view().has_local_media);
}
