//! In-process document store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use callwire_common::{Error, Result};
use chrono::Utc;
use tokio::sync::mpsc;

use crate::store::{Document, DocumentChange, DocumentStore, DocumentWatch};
use crate::value::Fields;

struct Entry {
    seq: u64,
    doc: Document,
    updates: usize,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Entry>,
    next_seq: u64,
    watchers: Vec<(String, mpsc::UnboundedSender<DocumentChange>)>,
    fail_writes: bool,
}

impl Inner {
    fn notify(&mut self, path: &str, change: DocumentChange) {
        self.watchers
            .retain(|(watched, tx)| watched != path || tx.send(change.clone()).is_ok());
    }
}

/// A [`DocumentStore`] kept in memory, with the same watch semantics as
/// the Firestore backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace a document.
    pub fn set(&self, path: &str, fields: Fields) {
        let mut inner = self.lock();
        let now = Utc::now();
        let existed = inner.docs.contains_key(path);
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = inner.docs.entry(path.to_string()).or_insert_with(|| Entry {
            seq,
            doc: Document {
                create_time: Some(now),
                ..Document::new(path, Fields::new())
            },
            updates: 0,
        });
        entry.doc.fields = fields;
        entry.doc.update_time = Some(now);
        let doc = entry.doc.clone();

        let change = if existed {
            DocumentChange::Modified(doc)
        } else {
            DocumentChange::Added(doc)
        };
        inner.notify(path, change);
    }

    /// Add a document with a generated id under `collection`; returns the id.
    pub fn add(&self, collection: &str, fields: Fields) -> String {
        let id = {
            let inner = self.lock();
            format!("doc{:06}", inner.next_seq)
        };
        self.set(&format!("{collection}/{id}"), fields);
        id
    }

    /// Merge top-level fields into an existing document.
    pub fn merge(&self, path: &str, fields: Fields) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .docs
            .get_mut(path)
            .ok_or_else(|| Error::transport(format!("{path}: document not found")))?;
        entry.doc.fields.extend(fields);
        entry.doc.update_time = Some(Utc::now());
        entry.updates += 1;
        let doc = entry.doc.clone();
        inner.notify(path, DocumentChange::Modified(doc));
        Ok(())
    }

    pub fn delete(&self, path: &str) {
        let mut inner = self.lock();
        if inner.docs.remove(path).is_some() {
            inner.notify(path, DocumentChange::Removed);
        }
    }

    pub fn snapshot(&self, path: &str) -> Option<Document> {
        self.lock().docs.get(path).map(|e| e.doc.clone())
    }

    /// Number of field merges applied to `path` since it was created.
    pub fn update_count(&self, path: &str) -> usize {
        self.lock().docs.get(path).map_or(0, |e| e.updates)
    }

    /// Make every subsequent `update` fail as a transport error.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Document>> {
        Ok(self.snapshot(path))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let prefix = format!("{collection}/");
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner
            .docs
            .iter()
            .filter(|(path, _)| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries.into_iter().map(|e| e.doc.clone()).collect())
    }

    async fn update(&self, path: &str, fields: Fields) -> Result<()> {
        if self.lock().fail_writes {
            return Err(Error::transport(format!("{path}: write rejected")));
        }
        self.merge(path, fields)
    }

    fn watch(&self, path: &str) -> DocumentWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if let Some(entry) = inner.docs.get(path) {
            let _ = tx.send(DocumentChange::Added(entry.doc.clone()));
        }
        inner.watchers.push((path.to_string(), tx));
        DocumentWatch::new(rx, None)
    }
}
