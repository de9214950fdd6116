//! End-to-end answer flow against an in-memory store and a real in-process
//! WebRTC caller.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callwire_answer::{answer_call, AnswerConfig, CallGate, TeardownReason};
use callwire_common::{Error, Result};
use callwire_signaling::{
    Document, DocumentStore, DocumentWatch, Fields, MemoryStore, SignalingClient, Value,
};
use tempfile::NamedTempFile;
use tokio::time::{timeout, Instant};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

const CALL: &str = "calls/c1";
const HOST_CANDIDATE: &str = "candidate:1 1 udp 2130706431 192.168.1.5 5000 typ host";

async fn caller() -> (RTCPeerConnection, String) {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .unwrap();

    let offer = pc.create_offer(None).await.unwrap();
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = gather_complete.recv().await;
    let sdp = pc.local_description().await.unwrap().sdp;
    (pc, sdp)
}

fn description(sdp: &str, kind: &str) -> Value {
    let mut fields = Fields::new();
    fields.insert("sdp".into(), Value::from(sdp));
    fields.insert("type".into(), Value::from(kind));
    Value::Map(fields)
}

fn candidate(text: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("candidate".into(), Value::from(text));
    fields.insert("sdpMid".into(), Value::from("0"));
    fields
}

/// Publish a call the way the browser side does.
fn publish_call(store: &MemoryStore, offer_sdp: &str, candidates: &[&str]) {
    let mut fields = Fields::new();
    fields.insert("offer".into(), description(offer_sdp, "offer"));
    store.set(CALL, fields);
    for text in candidates {
        store.add(&format!("{CALL}/offerCandidates"), candidate(text));
    }
}

fn vp8_clip(frames: u32) -> NamedTempFile {
    let mut out = Vec::new();
    out.extend_from_slice(b"DKIF");
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&32u16.to_le_bytes());
    out.extend_from_slice(b"VP80");
    out.extend_from_slice(&320u16.to_le_bytes());
    out.extend_from_slice(&240u16.to_le_bytes());
    out.extend_from_slice(&30u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&frames.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for i in 0..frames {
        let payload = [i as u8; 16];
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(i as u64).to_le_bytes());
        out.extend_from_slice(&payload);
    }

    let mut file = tempfile::Builder::new().suffix(".ivf").tempfile().unwrap();
    file.write_all(&out).unwrap();
    file.flush().unwrap();
    file
}

fn config_for(clip: &NamedTempFile) -> AnswerConfig {
    let mut config = AnswerConfig::new("c1");
    config.video_path = Some(clip.path().to_path_buf());
    config.ice_servers = vec![];
    config.max_call = Duration::from_secs(30);
    config
}

fn posted_answer(store: &MemoryStore) -> Option<(String, String)> {
    let doc = store.snapshot(CALL)?;
    let answer = doc.get_map("answer")?;
    Some((
        answer.get("sdp")?.as_str()?.to_string(),
        answer.get("type")?.as_str()?.to_string(),
    ))
}

async fn wait_for_answer(store: &MemoryStore) -> (String, String) {
    loop {
        if let Some(answer) = posted_answer(store) {
            return answer;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn set_hangup(store: &MemoryStore) {
    let mut fields = Fields::new();
    fields.insert("hangup".into(), Value::from(true));
    store.merge(CALL, fields).unwrap();
}

/// Reads and watches work; writes never complete.
struct StalledWrites(MemoryStore);

#[async_trait]
impl DocumentStore for StalledWrites {
    async fn get(&self, path: &str) -> Result<Option<Document>> {
        self.0.get(path).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        self.0.list(collection).await
    }

    async fn update(&self, _path: &str, _fields: Fields) -> Result<()> {
        std::future::pending().await
    }

    fn watch(&self, path: &str) -> DocumentWatch {
        self.0.watch(path)
    }
}

#[tokio::test]
async fn test_answer_then_remote_hangup() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &[HOST_CANDIDATE, "candidate:broken"]);
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(90);
    let config = config_for(&clip);

    let remote = async {
        let (sdp, kind) = wait_for_answer(&store).await;
        assert_eq!(kind, "answer");
        let answer = RTCSessionDescription::answer(sdp).unwrap();
        caller.set_remote_description(answer).await.unwrap();
        set_hangup(&store);
    };

    let (outcome, ()) = tokio::join!(answer_call(&config, &signaling, CallGate::new()), remote);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.reason, TeardownReason::Hangup);
    assert!(outcome.elapsed < config.max_call);
    // One merge for the answer, one for the hangup.
    assert_eq!(store.update_count(CALL), 2);
    caller.close().await.unwrap();
}

#[tokio::test]
async fn test_local_interrupt_ends_call() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &[HOST_CANDIDATE]);
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(30);
    let config = config_for(&clip);

    let gate = CallGate::new();
    let interrupt = gate.trigger();
    let operator = async {
        wait_for_answer(&store).await;
        assert!(interrupt.fire(TeardownReason::Interrupted));
    };

    let (outcome, ()) = tokio::join!(answer_call(&config, &signaling, gate), operator);
    assert_eq!(outcome.unwrap().reason, TeardownReason::Interrupted);
    caller.close().await.unwrap();
}

#[tokio::test]
async fn test_short_call_times_out() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &[HOST_CANDIDATE]);
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(30);
    let mut config = config_for(&clip);
    config.max_call = Duration::from_millis(300);

    let outcome = answer_call(&config, &signaling, CallGate::new())
        .await
        .unwrap();
    assert_eq!(outcome.reason, TeardownReason::Timeout);
    assert!(outcome.elapsed >= config.max_call);
    assert!(posted_answer(&store).is_some());
    caller.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_call_is_fatal() {
    let store = MemoryStore::new();
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(1);

    let err = answer_call(&config_for(&clip), &signaling, CallGate::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CallNotFound(_)));
    assert!(store.snapshot(CALL).is_none());
}

#[tokio::test]
async fn test_missing_media_is_fatal_before_signaling() {
    let store = MemoryStore::new();
    publish_call(&store, "v=0\r\n", &[HOST_CANDIDATE]);
    let signaling = SignalingClient::new(Arc::new(store.clone()));

    let mut config = AnswerConfig::new("c1");
    config.video_path = Some("/nonexistent/clip.ivf".into());
    let err = answer_call(&config, &signaling, CallGate::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MediaSourceUnavailable(_)));
    assert!(posted_answer(&store).is_none());
}

#[tokio::test]
async fn test_rejected_offer_leaves_no_answer() {
    let store = MemoryStore::new();
    publish_call(&store, "not an sdp blob", &[HOST_CANDIDATE]);
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(1);

    let err = answer_call(&config_for(&clip), &signaling, CallGate::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRemoteDescription(_)));
    assert!(posted_answer(&store).is_none());
}

#[tokio::test]
async fn test_answer_write_failure_is_fatal() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &[HOST_CANDIDATE]);
    store.fail_writes(true);
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(1);

    let err = answer_call(&config_for(&clip), &signaling, CallGate::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SignalingWriteError(_)));
    assert!(posted_answer(&store).is_none());
    assert_eq!(store.update_count(CALL), 0);
    caller.close().await.unwrap();
}

#[tokio::test]
async fn test_candidate_policy() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &["candidate:broken", "candidate:1 x udp"]);
    let signaling = SignalingClient::new(Arc::new(store.clone()));
    let clip = vp8_clip(1);

    let mut strict = config_for(&clip);
    strict.require_candidates = true;
    let err = answer_call(&strict, &signaling, CallGate::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoViableCandidates { rejected: 0 }));
    assert!(posted_answer(&store).is_none());

    // Degraded, not fatal, by default.
    let mut lenient = config_for(&clip);
    lenient.max_call = Duration::from_millis(200);
    let outcome = answer_call(&lenient, &signaling, CallGate::new())
        .await
        .unwrap();
    assert_eq!(outcome.reason, TeardownReason::Timeout);
    assert!(posted_answer(&store).is_some());
    caller.close().await.unwrap();
}

#[tokio::test]
async fn test_stalled_answer_write_ends_at_max_call() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &[HOST_CANDIDATE]);
    let signaling = SignalingClient::new(Arc::new(StalledWrites(store.clone())));
    let clip = vp8_clip(30);
    let mut config = config_for(&clip);
    config.max_call = Duration::from_millis(500);

    let started = Instant::now();
    let err = timeout(
        Duration::from_secs(10),
        answer_call(&config, &signaling, CallGate::new()),
    )
    .await
    .expect("call outlived max_call")
    .unwrap_err();
    assert!(matches!(err, Error::SignalingWriteError(_)));
    assert!(started.elapsed() >= config.max_call);
    assert!(posted_answer(&store).is_none());
    caller.close().await.unwrap();
}

#[tokio::test]
async fn test_interrupt_during_stalled_answer_write() {
    let (caller, offer_sdp) = caller().await;
    let store = MemoryStore::new();
    publish_call(&store, &offer_sdp, &[HOST_CANDIDATE]);
    let signaling = SignalingClient::new(Arc::new(StalledWrites(store.clone())));
    let clip = vp8_clip(30);
    let config = config_for(&clip);

    let gate = CallGate::new();
    let interrupt = gate.trigger();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        interrupt.fire(TeardownReason::Interrupted);
    });

    let err = timeout(Duration::from_secs(10), answer_call(&config, &signaling, gate))
        .await
        .expect("interrupt not observed during the answer write")
        .unwrap_err();
    assert!(matches!(err, Error::SignalingWriteError(_)));
    assert!(posted_answer(&store).is_none());
    caller.close().await.unwrap();
}
