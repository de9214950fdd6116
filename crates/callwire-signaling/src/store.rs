//! Document store abstraction.

use async_trait::async_trait;
use callwire_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::value::{fields_from_wire, Fields, Value};

/// A document snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Path relative to the database root, e.g. `calls/abc`.
    pub path: String,
    pub fields: Fields,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(path: impl Into<String>, fields: Fields) -> Self {
        Self {
            path: path.into(),
            fields,
            create_time: None,
            update_time: None,
        }
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_map(&self, field: &str) -> Option<&Fields> {
        self.get(field).and_then(Value::as_map)
    }

    /// Decode a REST document resource.
    ///
    /// `documents_root` is the `projects/{p}/databases/{d}/documents` prefix
    /// stripped from the resource name.
    pub fn from_wire(wire: &Json, documents_root: &str) -> Result<Self> {
        let name = wire
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::serialization("document without name"))?;
        let path = name
            .strip_prefix(documents_root)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(name)
            .to_string();

        Ok(Self {
            path,
            fields: fields_from_wire(wire.get("fields"))?,
            create_time: parse_time(wire.get("createTime"))?,
            update_time: parse_time(wire.get("updateTime"))?,
        })
    }
}

fn parse_time(wire: Option<&Json>) -> Result<Option<DateTime<Utc>>> {
    match wire.and_then(Json::as_str) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::serialization(format!("bad timestamp {raw:?}: {e}"))),
    }
}

/// One observed change of a watched document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    /// First snapshot, or the document (re)appeared.
    Added(Document),
    Modified(Document),
    Removed,
}

/// Live stream of changes for one document.
///
/// Dropping the watch stops the backing task.
pub struct DocumentWatch {
    rx: mpsc::UnboundedReceiver<DocumentChange>,
    task: Option<JoinHandle<()>>,
}

impl DocumentWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<DocumentChange>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    pub async fn next(&mut self) -> Option<DocumentChange> {
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DocumentWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Minimal document database surface used by the signaling client.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document; `None` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Document>>;

    /// All documents directly under `collection`, in creation order.
    async fn list(&self, collection: &str) -> Result<Vec<Document>>;

    /// Overwrite the given top-level fields of an existing document.
    async fn update(&self, path: &str, fields: Fields) -> Result<()>;

    /// Observe a document. The first event reflects the current snapshot.
    fn watch(&self, path: &str) -> DocumentWatch;
}
