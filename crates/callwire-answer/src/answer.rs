//! The answer flow for one call, from fetched offer to teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use callwire_common::{Error, Result};
use callwire_media::MediaOptions;
use callwire_signaling::SignalingClient;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::lifecycle::{self, CallGate, CallOutcome, TeardownReason, DEFAULT_MAX_CALL};
use crate::negotiator::PeerSession;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Everything needed to answer one call.
#[derive(Debug, Clone)]
pub struct AnswerConfig {
    pub call_id: String,
    /// File to stream; `None` selects the platform camera.
    pub video_path: Option<PathBuf>,
    pub max_call: Duration,
    pub ice_servers: Vec<String>,
    pub media: MediaOptions,
    /// Treat a call with no applied remote candidate as failed.
    pub require_candidates: bool,
}

impl AnswerConfig {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            video_path: None,
            max_call: DEFAULT_MAX_CALL,
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            media: MediaOptions::default(),
            require_candidates: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.call_id.trim().is_empty() {
            return Err(Error::config("call id must not be empty"));
        }
        if self.call_id.contains('/') {
            return Err(Error::config(format!(
                "call id {:?} must not contain '/'",
                self.call_id
            )));
        }
        if self.max_call.is_zero() {
            return Err(Error::config("max call duration must be positive"));
        }
        Ok(())
    }
}

/// Answer `config.call_id`, stream until the gate fires or the call times
/// out, and tear everything down.
///
/// Any fatal error closes whatever was built so far before returning. The
/// call document is left without an answer in that case. The answer write
/// races the gate and `max_call`; losing that race is a
/// [`Error::SignalingWriteError`].
pub async fn answer_call(
    config: &AnswerConfig,
    signaling: &SignalingClient,
    mut gate: CallGate,
) -> Result<CallOutcome> {
    config.validate()?;

    let track = Arc::new(callwire_media::resolve(
        config.video_path.as_deref(),
        &config.media,
    )?);
    let (offer, candidates) = signaling.fetch_offer(&config.call_id).await?;

    let mut session = PeerSession::new(&config.ice_servers).await?;
    let trigger = gate.trigger();

    let negotiated = async {
        session.accept_offer(&offer).await?;
        session.create_answer(Arc::clone(&track)).await?;

        let report = session.apply_candidates(&candidates).await?;
        if report.applied == 0 {
            if config.require_candidates {
                return Err(Error::NoViableCandidates {
                    rejected: report.rejected,
                });
            }
            warn!(
                "no remote candidate applied for {}; relying on candidates in the offer",
                config.call_id
            );
        }
        session.activate().await
    }
    .await;

    let answer = match negotiated {
        Ok(answer) => answer,
        Err(e) => {
            error!("answering {} failed: {}", config.call_id, e);
            session.close().await;
            return Err(e);
        }
    };

    // The call clock runs from here, including the answer write.
    let started = Instant::now();
    let deadline = started + config.max_call;
    let mut subscription = signaling.subscribe_hangup(&config.call_id, move || {
        trigger.fire(TeardownReason::Hangup);
    });

    let written = gate
        .race(deadline, signaling.post_answer(&config.call_id, &answer))
        .await;
    let failure = match written {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(reason) => Some(Error::signaling_write(format!(
            "answer for {} not written before {}",
            config.call_id, reason
        ))),
    };
    if let Some(e) = failure {
        error!("answering {} failed: {}", config.call_id, e);
        subscription.cancel();
        session.close().await;
        return Err(e);
    }

    info!("answered call {}", config.call_id);
    let outcome =
        lifecycle::supervise(&mut session, subscription, gate, started, config.max_call).await;
    Ok(outcome)
}
