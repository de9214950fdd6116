//! Call teardown: whichever of timeout, hangup or local interrupt comes
//! first ends the call, exactly once.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callwire_signaling::HangupSubscription;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default upper bound on a call.
pub const DEFAULT_MAX_CALL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    Timeout,
    Hangup,
    Interrupted,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownReason::Timeout => "timeout",
            TeardownReason::Hangup => "remote hangup",
            TeardownReason::Interrupted => "local interrupt",
        })
    }
}

/// What the lifecycle manager tears down.
#[async_trait]
pub trait CallSession: Send {
    /// Release everything. Must tolerate repeated calls.
    async fn close(&mut self);
}

/// Cloneable handle that fires the gate. Only the first fire counts.
#[derive(Clone)]
pub struct GateTrigger {
    slot: Arc<Mutex<Option<oneshot::Sender<TeardownReason>>>>,
}

impl GateTrigger {
    /// Returns `true` if this call was the one that fired the gate.
    pub fn fire(&self, reason: TeardownReason) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // The receiver may already be gone if the gate was dropped.
                let _ = tx.send(reason);
                true
            }
            None => {
                debug!("gate already fired; ignoring {}", reason);
                false
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// One-shot, first-writer-wins teardown signal.
pub struct CallGate {
    trigger: GateTrigger,
    rx: oneshot::Receiver<TeardownReason>,
    settled: Option<TeardownReason>,
}

impl CallGate {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            trigger: GateTrigger {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
            settled: None,
        }
    }

    pub fn trigger(&self) -> GateTrigger {
        self.trigger.clone()
    }

    /// Wait for the first fire, or until `limit` elapses.
    pub async fn wait(mut self, limit: Duration) -> TeardownReason {
        self.wait_until(Instant::now() + limit).await
    }

    /// Wait for the first fire, or until `deadline`.
    ///
    /// The timeout competes for the gate like any other trigger, so a fire
    /// that lands right at the deadline is reported faithfully. Once
    /// settled, later calls return the same reason immediately.
    pub async fn wait_until(&mut self, deadline: Instant) -> TeardownReason {
        if let Some(reason) = self.settled {
            return reason;
        }
        let reason = match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(reason)) => reason,
            _ => {
                tokio::time::sleep_until(deadline).await;
                self.trigger.fire(TeardownReason::Timeout);
                self.rx.try_recv().unwrap_or(TeardownReason::Timeout)
            }
        };
        self.settled = Some(reason);
        reason
    }

    /// Drive `work` unless the gate fires or `deadline` passes first.
    ///
    /// On `Err` the gate is settled and `work` has been dropped.
    pub async fn race<F: Future>(
        &mut self,
        deadline: Instant,
        work: F,
    ) -> Result<F::Output, TeardownReason> {
        tokio::select! {
            biased;
            output = work => Ok(output),
            reason = self.wait_until(deadline) => Err(reason),
        }
    }
}

impl Default for CallGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub reason: TeardownReason,
    /// Time from the session going active to teardown.
    pub elapsed: Duration,
}

/// Hold an active call until the gate fires or `max_call` past `started`
/// elapses, then close the session and cancel the hangup subscription.
///
/// `started` is when the session went active; time spent before this is
/// called counts against `max_call`.
pub async fn supervise<S: CallSession + ?Sized>(
    session: &mut S,
    mut subscription: HangupSubscription,
    mut gate: CallGate,
    started: Instant,
    max_call: Duration,
) -> CallOutcome {
    let deadline = started + max_call;
    info!(
        "call active, ending after at most {}s",
        deadline.saturating_duration_since(Instant::now()).as_secs()
    );

    let reason = gate.wait_until(deadline).await;
    let elapsed = started.elapsed();
    info!(
        "ending call after {:.1}s: {}",
        elapsed.as_secs_f64(),
        reason
    );

    session.close().await;
    subscription.cancel();
    CallOutcome { reason, elapsed }
}
