//! Cloud Firestore backend over the v1 REST API.
//!
//! Live updates are emulated by polling the watched document and comparing
//! `updateTime` between snapshots.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callwire_common::{Error, Result};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::credentials::{ServiceAccountKey, TokenSource};
use crate::store::{Document, DocumentChange, DocumentStore, DocumentWatch};
use crate::value::{fields_to_wire, Fields};

pub const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";
pub const EMULATOR_HOST_ENV: &str = "FIRESTORE_EMULATOR_HOST";
pub const EMULATOR_PROJECT_ENV: &str = "GCLOUD_PROJECT";
pub const DEFAULT_EMULATOR_PROJECT: &str = "demo-callwire";

/// Upper bound on any single REST round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const LIST_PAGE_SIZE: u32 = 300;

#[derive(Clone)]
enum Auth {
    ServiceAccount(Arc<TokenSource>),
    /// The emulator accepts this fixed bearer and bypasses security rules.
    Emulator,
}

#[derive(Clone)]
pub struct FirestoreStore {
    http: reqwest::Client,
    api_base: String,
    documents_root: String,
    auth: Auth,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl FirestoreStore {
    /// Production client authenticated with a service account.
    pub fn new(key: ServiceAccountKey, poll_interval: Duration) -> Result<Self> {
        let http = http_client()?;
        let documents_root = documents_root(&key.project_id);
        let tokens = TokenSource::new(key, http.clone())?;
        Ok(Self {
            http,
            api_base: FIRESTORE_API.to_string(),
            documents_root,
            auth: Auth::ServiceAccount(Arc::new(tokens)),
            poll_interval,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Client for a local emulator, e.g. `127.0.0.1:8080`.
    pub fn emulator(host: &str, project_id: &str, poll_interval: Duration) -> Result<Self> {
        Self::with_base_url(&format!("http://{host}/v1"), project_id, poll_interval)
    }

    /// Unauthenticated client rooted at an arbitrary `.../v1` base URL.
    pub fn with_base_url(
        api_base: &str,
        project_id: &str,
        poll_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            documents_root: documents_root(project_id),
            auth: Auth::Emulator,
            poll_interval,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Override [`REQUEST_TIMEOUT`] for document requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Emulator when `FIRESTORE_EMULATOR_HOST` is set, otherwise the
    /// service-account key at `credentials_path`.
    pub fn from_env(credentials_path: &Path, poll_interval: Duration) -> Result<Self> {
        if let Ok(host) = std::env::var(EMULATOR_HOST_ENV) {
            if !host.trim().is_empty() {
                let project = std::env::var(EMULATOR_PROJECT_ENV)
                    .unwrap_or_else(|_| DEFAULT_EMULATOR_PROJECT.to_string());
                info!("using Firestore emulator at {} (project {})", host, project);
                return Self::emulator(host.trim(), &project, poll_interval);
            }
        }

        let key = ServiceAccountKey::from_file(credentials_path)?;
        info!(
            "using Firestore project {} as {}",
            key.project_id, key.client_email
        );
        Self::new(key, poll_interval)
    }

    fn document_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.documents_root, path)
    }

    async fn request(&self, method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder> {
        let builder = self.http.request(method, url).timeout(self.request_timeout);
        let token = match &self.auth {
            Auth::ServiceAccount(tokens) => tokens.token().await?,
            Auth::Emulator => "owner".to_string(),
        };
        Ok(builder.bearer_auth(token))
    }

    async fn fetch(&self, path: &str) -> Result<Option<Document>> {
        let response = self
            .request(reqwest::Method::GET, &self.document_url(path))
            .await?
            .send()
            .await
            .map_err(|e| Error::transport(format!("GET {path}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = checked_json(response, "GET", path).await?;
        Document::from_wire(&body, &self.documents_root).map(Some)
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::transport(format!("cannot build HTTP client: {e}")))
}

fn documents_root(project_id: &str) -> String {
    format!("projects/{project_id}/databases/(default)/documents")
}

async fn checked_json(response: reqwest::Response, method: &str, path: &str) -> Result<Json> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::transport(format!("{method} {path}: {status} {body}")));
    }
    response
        .json()
        .await
        .map_err(|e| Error::transport(format!("{method} {path}: malformed body: {e}")))
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn get(&self, path: &str) -> Result<Option<Document>> {
        self.fetch(path).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let url = self.document_url(collection);
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", LIST_PAGE_SIZE.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let response = self
                .request(reqwest::Method::GET, &url)
                .await?
                .query(&query)
                .send()
                .await
                .map_err(|e| Error::transport(format!("LIST {collection}: {e}")))?;
            let body = checked_json(response, "LIST", collection).await?;

            if let Some(Json::Array(items)) = body.get("documents") {
                for item in items {
                    documents.push(Document::from_wire(item, &self.documents_root)?);
                }
            }
            match body.get("nextPageToken").and_then(Json::as_str) {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }

        // REST lists by document id; insertion order is the create time.
        documents.sort_by_key(|doc| doc.create_time);
        Ok(documents)
    }

    async fn update(&self, path: &str, fields: Fields) -> Result<()> {
        let mut query: Vec<(&str, &str)> = fields
            .keys()
            .map(|k| ("updateMask.fieldPaths", k.as_str()))
            .collect();
        query.push(("currentDocument.exists", "true"));

        let response = self
            .request(reqwest::Method::PATCH, &self.document_url(path))
            .await?
            .query(&query)
            .json(&json!({ "fields": fields_to_wire(&fields) }))
            .send()
            .await
            .map_err(|e| Error::transport(format!("PATCH {path}: {e}")))?;
        checked_json(response, "PATCH", path).await?;
        Ok(())
    }

    fn watch(&self, path: &str) -> DocumentWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let path = path.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Option<Document>> = None;

            loop {
                ticker.tick().await;
                let snapshot = match store.fetch(&path).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("polling {} failed: {}", path, e);
                        continue;
                    }
                };

                let change = match (&last, &snapshot) {
                    (None | Some(None), Some(doc)) => Some(DocumentChange::Added(doc.clone())),
                    (Some(Some(prev)), Some(doc))
                        if prev.update_time != doc.update_time || prev.fields != doc.fields =>
                    {
                        Some(DocumentChange::Modified(doc.clone()))
                    }
                    (Some(Some(_)), None) => Some(DocumentChange::Removed),
                    _ => None,
                };
                last = Some(snapshot);

                if let Some(change) = change {
                    debug!("{} changed: {:?}", path, change_kind(&change));
                    if tx.send(change).is_err() {
                        break;
                    }
                }
            }
        });

        DocumentWatch::new(rx, Some(task))
    }
}

fn change_kind(change: &DocumentChange) -> &'static str {
    match change {
        DocumentChange::Added(_) => "added",
        DocumentChange::Modified(_) => "modified",
        DocumentChange::Removed => "removed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_url_layout() {
        let store =
            FirestoreStore::emulator("127.0.0.1:8080", "demo-callwire", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            store.document_url("calls/abc"),
            "http://127.0.0.1:8080/v1/projects/demo-callwire/databases/(default)/documents/calls/abc"
        );
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let store =
            FirestoreStore::with_base_url("http://localhost:9/v1/", "p", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            store.document_url("calls/x"),
            "http://localhost:9/v1/projects/p/databases/(default)/documents/calls/x"
        );
    }
}
