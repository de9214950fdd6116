//! Call-document signaling on top of a [`DocumentStore`].

use std::sync::{Arc, Mutex};

use callwire_common::{Error, IceCandidateRecord, Result, SdpType, SessionDescription};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{Document, DocumentChange, DocumentStore};
use crate::value::{Fields, Value};

pub const CALLS_COLLECTION: &str = "calls";
pub const OFFER_CANDIDATES: &str = "offerCandidates";

const OFFER_FIELD: &str = "offer";
const ANSWER_FIELD: &str = "answer";
const HANGUP_FIELD: &str = "hangup";

type HangupCallback = Box<dyn FnOnce() + Send>;

/// Reads offers, writes answers and watches for hangups.
#[derive(Clone)]
pub struct SignalingClient {
    store: Arc<dyn DocumentStore>,
}

impl SignalingClient {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn call_path(call_id: &str) -> String {
        format!("{CALLS_COLLECTION}/{call_id}")
    }

    /// The call's offer and its remote candidates in insertion order.
    ///
    /// Candidates that do not parse are logged and left out.
    pub async fn fetch_offer(
        &self,
        call_id: &str,
    ) -> Result<(SessionDescription, Vec<IceCandidateRecord>)> {
        let path = Self::call_path(call_id);
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| Error::call_not_found(format!("no document at {path}")))?;
        let offer = offer_from_document(&doc)?;

        let candidate_docs = self
            .store
            .list(&format!("{path}/{OFFER_CANDIDATES}"))
            .await?;
        let mut candidates = Vec::with_capacity(candidate_docs.len());
        for cand_doc in &candidate_docs {
            let (Some(text), Some(sdp_mid)) = (cand_doc.get_str("candidate"), cand_doc.get_str("sdpMid"))
            else {
                warn!("skipping candidate {}: missing candidate/sdpMid", cand_doc.id());
                continue;
            };
            match IceCandidateRecord::parse(text, sdp_mid) {
                Ok(record) => {
                    debug!("candidate {}: {}", cand_doc.id(), record);
                    candidates.push(record);
                }
                Err(e) => warn!("skipping candidate {}: {}", cand_doc.id(), e),
            }
        }

        info!(
            "fetched offer for {} ({} bytes SDP, {}/{} candidates usable)",
            call_id,
            offer.sdp.len(),
            candidates.len(),
            candidate_docs.len()
        );
        Ok((offer, candidates))
    }

    /// Write the local answer into the call document. Never retried.
    pub async fn post_answer(&self, call_id: &str, answer: &SessionDescription) -> Result<()> {
        let mut description = Fields::new();
        description.insert("sdp".into(), Value::from(answer.sdp.as_str()));
        description.insert("type".into(), Value::from(answer.sdp_type.as_str()));

        let mut fields = Fields::new();
        fields.insert(ANSWER_FIELD.into(), Value::Map(description));

        self.store
            .update(&Self::call_path(call_id), fields)
            .await
            .map_err(Error::signaling_write)?;
        info!("answer posted for {}", call_id);
        Ok(())
    }

    /// Invoke `on_hangup` once, when a modification sets `hangup` to true.
    ///
    /// The initial snapshot and deletions never trigger it. Must be called
    /// from within a tokio runtime.
    pub fn subscribe_hangup<F>(&self, call_id: &str, on_hangup: F) -> HangupSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        let path = Self::call_path(call_id);
        let mut watch = self.store.watch(&path);
        let slot: Arc<Mutex<Option<HangupCallback>>> = Arc::new(Mutex::new(Some(Box::new(on_hangup))));
        let task_slot = Arc::clone(&slot);

        let task = tokio::spawn(async move {
            while let Some(change) = watch.next().await {
                match change {
                    DocumentChange::Modified(doc) if doc.get_bool(HANGUP_FIELD) == Some(true) => {
                        info!("hangup observed on {}", path);
                        fire(&task_slot);
                        break;
                    }
                    DocumentChange::Modified(_) => debug!("{} modified without hangup", path),
                    DocumentChange::Added(_) => debug!("{} snapshot received", path),
                    DocumentChange::Removed => warn!("{} was deleted", path),
                }
            }
        });

        HangupSubscription {
            slot,
            task: Some(task),
        }
    }
}

fn fire(slot: &Mutex<Option<HangupCallback>>) {
    // The lock is held while the callback runs so `cancel` cannot return
    // in the middle of a firing.
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(callback) = guard.take() {
        callback();
    }
}

fn offer_from_document(doc: &Document) -> Result<SessionDescription> {
    let offer = doc
        .get_map(OFFER_FIELD)
        .ok_or_else(|| Error::call_not_found(format!("{} has no offer", doc.path)))?;
    let sdp = offer
        .get("sdp")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::call_not_found(format!("{} offer has no sdp", doc.path)))?;
    let sdp_type = match offer.get("type").and_then(Value::as_str) {
        Some(raw) => raw.parse::<SdpType>()?,
        None => SdpType::Offer,
    };
    Ok(SessionDescription {
        sdp: sdp.to_string(),
        sdp_type,
    })
}

/// Handle for a live hangup subscription. Dropping it cancels.
pub struct HangupSubscription {
    slot: Arc<Mutex<Option<HangupCallback>>>,
    task: Option<JoinHandle<()>>,
}

impl HangupSubscription {
    /// Stop watching. Safe to call any number of times; once it returns the
    /// callback will not run.
    pub fn cancel(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("hangup subscription cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for HangupSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
