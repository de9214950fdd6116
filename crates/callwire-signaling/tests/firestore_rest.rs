//! Integration tests for the Firestore REST backend against an in-process fake.
//!
//! Covers:
//! - document fetch and 404 handling
//! - candidate listing across pages, ordered by create time
//! - answer PATCH with update mask
//! - polling watch feeding the hangup subscription
//! - request timeout against a server that never answers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use callwire_common::{Error, SessionDescription};
use callwire_signaling::{DocumentStore, FirestoreStore, SignalingClient};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

const ROOT: &str = "projects/demo/databases/(default)/documents";

#[derive(Default)]
struct FakeState {
    docs: HashMap<String, Value>,
    clock: u64,
    bearers: Vec<String>,
}

type Shared = Arc<Mutex<FakeState>>;

fn timestamp(tick: u64) -> String {
    format!("2024-05-01T10:{:02}:{:02}.{:06}Z", tick / 60, tick % 60, tick)
}

fn insert(state: &Shared, path: &str, fields: Value, create_tick: u64) {
    let mut s = state.lock().unwrap();
    s.docs.insert(
        path.to_string(),
        json!({
            "name": format!("{ROOT}/{path}"),
            "fields": fields,
            "createTime": timestamp(create_tick),
            "updateTime": timestamp(create_tick),
        }),
    );
}

fn relative(rest: &str) -> String {
    rest.trim_start_matches('/')
        .strip_prefix(ROOT)
        .unwrap_or(rest)
        .trim_start_matches('/')
        .to_string()
}

fn record_bearer(state: &Shared, headers: &HeaderMap) {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.lock().unwrap().bearers.push(auth.to_string());
    }
}

async fn handle_get(
    State(state): State<Shared>,
    Path(rest): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    record_bearer(&state, &headers);
    let path = relative(&rest);
    let s = state.lock().unwrap();

    // Odd segment count: a collection.
    if path.split('/').count() % 2 == 1 {
        let prefix = format!("{path}/");
        let mut ids: Vec<&String> = s
            .docs
            .keys()
            .filter(|k| k.strip_prefix(&prefix).is_some_and(|r| !r.contains('/')))
            .collect();
        ids.sort();

        let start: usize = query
            .iter()
            .find(|(k, _)| k == "pageToken")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        let page: Vec<Value> = ids.iter().skip(start).take(2).map(|k| s.docs[*k].clone()).collect();
        let mut body = json!({ "documents": page });
        if start + 2 < ids.len() {
            body["nextPageToken"] = json!((start + 2).to_string());
        }
        return Ok(Json(body));
    }

    s.docs.get(&path).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn handle_patch(
    State(state): State<Shared>,
    Path(rest): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let path = relative(&rest);
    let mask: Vec<&str> = query
        .iter()
        .filter(|(k, _)| k == "updateMask.fieldPaths")
        .map(|(_, v)| v.as_str())
        .collect();
    let must_exist = query
        .iter()
        .any(|(k, v)| k == "currentDocument.exists" && v == "true");

    let mut s = state.lock().unwrap();
    s.clock += 1;
    let tick = 1000 + s.clock;
    let doc = match s.docs.get_mut(&path) {
        Some(doc) => doc,
        None if must_exist => return Err(StatusCode::NOT_FOUND),
        None => return Err(StatusCode::BAD_REQUEST),
    };
    for field in mask {
        if let Some(value) = body["fields"].get(field) {
            doc["fields"][field] = value.clone();
        }
    }
    doc["updateTime"] = json!(timestamp(tick));
    Ok(Json(doc.clone()))
}

async fn spawn_fake(state: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/v1/*rest", get(handle_get).patch(handle_patch))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn store_for(addr: SocketAddr) -> FirestoreStore {
    FirestoreStore::emulator(&addr.to_string(), "demo", Duration::from_millis(20)).unwrap()
}

fn offer_doc() -> Value {
    json!({
        "offer": { "mapValue": { "fields": {
            "sdp": { "stringValue": "v=0\r\n" },
            "type": { "stringValue": "offer" }
        }}},
        "uid": { "stringValue": "answerer" }
    })
}

fn candidate_doc(candidate: &str) -> Value {
    json!({
        "candidate": { "stringValue": candidate },
        "sdpMid": { "stringValue": "0" },
        "sdpMLineIndex": { "integerValue": "0" }
    })
}

#[tokio::test]
async fn test_get_missing_document_is_none() {
    let state = Shared::default();
    let store = store_for(spawn_fake(state.clone()).await);

    assert!(store.get("calls/nope").await.unwrap().is_none());
    assert_eq!(state.lock().unwrap().bearers, vec!["Bearer owner".to_string()]);
}

#[tokio::test]
async fn test_fetch_offer_pages_and_orders_by_create_time() {
    let state = Shared::default();
    insert(&state, "calls/c1", offer_doc(), 1);
    // Ids sort opposite to creation order.
    insert(&state, "calls/c1/offerCandidates/zz", candidate_doc("candidate:1 1 udp 2130706431 192.168.1.5 5000 typ host"), 2);
    insert(&state, "calls/c1/offerCandidates/yy", candidate_doc("candidate:2 1 udp 1694498815 203.0.113.9 61000 typ srflx raddr 192.168.1.5 rport 5000"), 3);
    insert(&state, "calls/c1/offerCandidates/xx", candidate_doc("candidate:3 1 udp 16777215 198.51.100.4 3478 typ relay"), 4);

    let client = SignalingClient::new(Arc::new(store_for(spawn_fake(state).await)));
    let (offer, candidates) = client.fetch_offer("c1").await.unwrap();

    assert_eq!(offer, SessionDescription::offer("v=0\r\n"));
    let foundations: Vec<&str> = candidates.iter().map(|c| c.foundation.as_str()).collect();
    assert_eq!(foundations, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_fetch_offer_unknown_call() {
    let client = SignalingClient::new(Arc::new(store_for(spawn_fake(Shared::default()).await)));
    assert!(matches!(
        client.fetch_offer("missing").await,
        Err(Error::CallNotFound(_))
    ));
}

#[tokio::test]
async fn test_post_answer_patches_only_answer() {
    let state = Shared::default();
    insert(&state, "calls/c1", offer_doc(), 1);
    let client = SignalingClient::new(Arc::new(store_for(spawn_fake(state.clone()).await)));

    client
        .post_answer("c1", &SessionDescription::answer("v=0 answer"))
        .await
        .unwrap();

    let s = state.lock().unwrap();
    let fields = &s.docs["calls/c1"]["fields"];
    assert_eq!(
        fields["answer"],
        json!({ "mapValue": { "fields": {
            "sdp": { "stringValue": "v=0 answer" },
            "type": { "stringValue": "answer" }
        }}})
    );
    assert_eq!(fields["uid"], json!({ "stringValue": "answerer" }));
}

#[tokio::test]
async fn test_post_answer_to_missing_call_fails() {
    let client = SignalingClient::new(Arc::new(store_for(spawn_fake(Shared::default()).await)));
    let err = client
        .post_answer("gone", &SessionDescription::answer("v=0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SignalingWriteError(_)));
}

#[tokio::test]
async fn test_polling_watch_delivers_hangup() {
    let state = Shared::default();
    insert(&state, "calls/c1", offer_doc(), 1);
    let client = SignalingClient::new(Arc::new(store_for(spawn_fake(state.clone()).await)));

    let (tx, rx) = oneshot::channel();
    let _sub = client.subscribe_hangup("c1", move || {
        let _ = tx.send(());
    });

    // Let the first poll record the initial snapshot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let mut s = state.lock().unwrap();
        let doc = s.docs.get_mut("calls/c1").unwrap();
        doc["fields"]["hangup"] = json!({ "booleanValue": true });
        doc["updateTime"] = json!(timestamp(500));
    }

    timeout(Duration::from_secs(5), rx)
        .await
        .expect("hangup not observed")
        .unwrap();
}

#[tokio::test]
async fn test_stalled_answer_write_times_out() {
    // Accepts the connection, never responds.
    let app = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        StatusCode::OK
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let store = store_for(addr).with_request_timeout(Duration::from_millis(200));
    let client = SignalingClient::new(Arc::new(store));
    let result = timeout(
        Duration::from_secs(5),
        client.post_answer("c1", &SessionDescription::answer("v=0")),
    )
    .await
    .expect("write was not bounded");
    assert!(matches!(result, Err(Error::SignalingWriteError(_))));
}
