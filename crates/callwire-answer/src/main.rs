#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callwire_answer::{answer_call, AnswerConfig, CallGate, TeardownReason, DEFAULT_STUN_SERVERS};
use callwire_media::{MediaOptions, DEFAULT_FFMPEG};
use callwire_signaling::{FirestoreStore, SignalingClient};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "callwire-answer")]
#[command(about = "Answer a WebRTC video call published in Firestore")]
struct Args {
    /// Id of the document under `calls/` holding the offer
    call_id: String,

    /// Video file to stream (IVF VP8/VP9 or raw H.264); defaults to the camera
    video_path: Option<PathBuf>,

    /// Service account key for Firestore
    #[arg(
        long,
        env = "FIREBASE_CREDENTIALS",
        default_value = "firebase-adminsdk.json"
    )]
    credentials: PathBuf,

    /// Hang up after this many seconds
    #[arg(long, env = "CALLWIRE_MAX_CALL_SECS", default_value_t = 120)]
    max_call_secs: u64,

    /// How often the call document is polled for a hangup
    #[arg(long, env = "CALLWIRE_POLL_INTERVAL_MS", default_value_t = 1_000)]
    poll_interval_ms: u64,

    /// STUN/TURN server URL (repeatable)
    #[arg(
        long = "stun",
        env = "CALLWIRE_STUN_URLS",
        value_delimiter = ',',
        default_values_t = DEFAULT_STUN_SERVERS.map(String::from)
    )]
    stun: Vec<String>,

    /// ffmpeg executable used for camera capture
    #[arg(long, env = "CALLWIRE_FFMPEG", default_value = DEFAULT_FFMPEG)]
    ffmpeg: String,

    /// Fail the call when no remote candidate could be applied
    #[arg(long, env = "CALLWIRE_REQUIRE_CANDIDATES", default_value_t = false)]
    require_candidates: bool,
}

impl Args {
    fn answer_config(&self) -> AnswerConfig {
        AnswerConfig {
            call_id: self.call_id.clone(),
            video_path: self.video_path.clone(),
            max_call: Duration::from_secs(self.max_call_secs),
            ice_servers: self.stun.clone(),
            media: MediaOptions {
                ffmpeg: self.ffmpeg.clone(),
            },
            require_candidates: self.require_candidates,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    callwire_common::init_tracing();
    let args = Args::parse();
    let config = args.answer_config();

    if args.poll_interval_ms == 0 {
        anyhow::bail!("--poll-interval-ms must be positive");
    }
    let store = FirestoreStore::from_env(
        &args.credentials,
        Duration::from_millis(args.poll_interval_ms),
    )
    .with_context(|| format!("failed to set up Firestore from {}", args.credentials.display()))?;
    let signaling = SignalingClient::new(Arc::new(store));

    let gate = CallGate::new();
    let interrupt = gate.trigger();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, hanging up");
                interrupt.fire(TeardownReason::Interrupted);
            }
            Err(e) => warn!("cannot listen for Ctrl-C: {}", e),
        }
    });

    let outcome = answer_call(&config, &signaling, gate)
        .await
        .with_context(|| format!("call {} failed", config.call_id))?;
    info!(
        "call {} ended by {} after {:.1}s",
        config.call_id,
        outcome.reason,
        outcome.elapsed.as_secs_f64()
    );
    Ok(())
}
