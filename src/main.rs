//! Terminal front end
//!
//! Shows the assigned identity, then reads commands from stdin:
//! `call <id>`, `hangup`, `status`, `quit`.

use anyhow::{Context, Result};
use clap::Parser;
use peercall::config::{BookkeepingConfig, PeerServerConfig};
use peercall::{logging, App, AppConfig, SessionEvent};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "P2P video calls over a PeerJS server", long_about = None)]
struct Args {
    /// Signaling server URL, e.g. wss://0.peerjs.com:443/
    #[arg(short, long, env = "SIGNALING_URL")]
    server: Option<String>,

    /// PeerJS API key
    #[arg(long, env = "PEERCALL_KEY")]
    key: Option<String>,

    /// Register with this identity instead of asking the server for one
    #[arg(long, env = "PEERCALL_PEER_ID")]
    peer_id: Option<String>,

    /// IVF file (VP8/VP9) used as the camera
    #[arg(long, env = "PEERCALL_VIDEO_FILE")]
    video: Option<PathBuf>,

    /// Ogg/Opus file used as the microphone
    #[arg(long, env = "PEERCALL_AUDIO_FILE")]
    audio: Option<PathBuf>,

    /// Replay media files when they end
    #[arg(long = "loop")]
    looping: bool,

    /// Base URL of the bookkeeping backend
    #[arg(long, env = "PEERCALL_BOOKKEEPING_URL")]
    bookkeeping_url: Option<String>,

    /// Identity to call once registered
    #[arg(short, long)]
    call: Option<String>,

    /// Log filter, e.g. "peercall=trace"
    #[arg(long, env = "PEERCALL_LOG")]
    log: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(server) = &self.server {
            let peer_id = config.peer_server.peer_id.take();
            config.peer_server = PeerServerConfig::from_url(server)?;
            config.peer_server.peer_id = peer_id;
        }
        if let Some(key) = &self.key {
            config.peer_server.key = key.clone();
        }
        if let Some(peer_id) = &self.peer_id {
            config.peer_server.peer_id = Some(peer_id.clone());
        }
        if let Some(video) = &self.video {
            config.media.video_file = Some(video.clone());
        }
        if let Some(audio) = &self.audio {
            config.media.audio_file = Some(audio.clone());
        }
        if self.looping {
            config.media.looping = true;
        }
        if let Some(url) = &self.bookkeeping_url {
            let timeout_ms = config.bookkeeping.as_ref().map(|b| b.timeout_ms).unwrap_or(5_000);
            config.bookkeeping = Some(BookkeepingConfig {
                url: url.clone(),
                timeout_ms,
            });
        }
        if let Some(log) = &self.log {
            config.log_filter = log.clone();
        }

        config.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env().context("Invalid environment configuration")?;
    args.apply(&mut config).context("Invalid command line configuration")?;

    logging::init(&config.log_filter);
    tracing::info!("Starting peercall {}", env!("CARGO_PKG_VERSION"));

    let app = App::from_config(&config)?;

    let mut events = app.session().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let launch = app.launch().await;
    if let Err(e) = &launch.media {
        println!("Local media unavailable ({e}); calls are disabled");
    }
    let identity = match launch.session {
        Ok(identity) => identity,
        Err(e) => {
            app.shutdown().await;
            return Err(e).context("Could not register with the signaling server");
        }
    };
    println!("Your ID: {identity}");

    if let Some(remote) = &args.call {
        if let Err(e) = app.session().place_call(remote).await {
            println!("Call failed: {e}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&app, line.trim()).await {
                    break;
                }
            }
        }
    }

    app.shutdown().await;
    Ok(())
}

/// Returns `false` when the user wants to quit
async fn handle_command(app: &App, line: &str) -> bool {
    let mut parts = line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some("call"), Some(remote)) => {
            if let Err(e) = app.session().place_call(remote).await {
                println!("Call failed: {e}");
            }
        }
        (Some("call"), None) => println!("Usage: call <id>"),
        (Some("hangup"), _) => {
            if !app.session().hang_up().await {
                println!("No active session");
            }
        }
        (Some("status"), _) => match serde_json::to_string_pretty(&app.view()) {
            Ok(view) => println!("{view}"),
            Err(e) => tracing::error!("Failed to render status: {}", e),
        },
        (Some("quit") | Some("exit"), _) => return false,
        (None, _) => {}
        (Some(other), _) => println!("Unknown command '{other}' (call <id>, hangup, status, quit)"),
    }

    true
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Registered { .. } => {}
        SessionEvent::CallStarted { remote, direction, .. } => {
            println!("Call with {remote} ({direction:?})");
        }
        SessionEvent::IncomingIgnored { remote, reason } => {
            println!("Ignored call from {remote} ({reason:?})");
        }
        SessionEvent::RemoteStream { stream_id, .. } => {
            println!("Receiving remote stream {stream_id}");
        }
        SessionEvent::CallEnded { .. } => println!("Call ended"),
        SessionEvent::Terminated => println!("Session ended"),
    }
}
