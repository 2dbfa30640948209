//! JSON-file backend.
//!
//! Each record kind lives in one file holding a JSON array. Writes go through
//! a [`CollectionTx`]: the whole array is read, mutated in memory and
//! rewritten. The transaction lock only covers this process; two processes
//! pointed at the same directory can still lose each other's writes.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::naming::{self, Convention};
use super::{BackendKind, Document, DocumentBackend, RecordKind, StoreError, StoreResult};

pub struct FileBackend {
    dir: PathBuf,
    accounts_lock: Arc<Mutex<()>>,
    qrcodes_lock: Arc<Mutex<()>>,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            accounts_lock: Arc::new(Mutex::new(())),
            qrcodes_lock: Arc::new(Mutex::new(())),
        }
    }

    fn path(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn lock(&self, kind: RecordKind) -> Arc<Mutex<()>> {
        match kind {
            RecordKind::Account => self.accounts_lock.clone(),
            RecordKind::QrCode => self.qrcodes_lock.clone(),
        }
    }

    /// Takes the collection's write lock and loads its current contents.
    pub async fn begin(&self, kind: RecordKind) -> StoreResult<CollectionTx> {
        let guard = self.lock(kind).lock_owned().await;
        let path = self.path(kind);
        let docs = read_collection(&path, kind).await?;
        Ok(CollectionTx {
            kind,
            dir: self.dir.clone(),
            path,
            docs,
            _guard: guard,
        })
    }
}

/// Exclusive read-modify-write over one collection file. Dropping the
/// transaction without [`commit`](CollectionTx::commit) discards the changes.
pub struct CollectionTx {
    kind: RecordKind,
    dir: PathBuf,
    path: PathBuf,
    docs: Vec<Document>,
    _guard: OwnedMutexGuard<()>,
}

impl CollectionTx {
    #[cfg(test)]
    pub fn docs(&self) -> &[Document] {
        &self.docs
    }

    pub fn docs_mut(&mut self) -> &mut Vec<Document> {
        &mut self.docs
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.docs.iter().position(|d| d.get("id").and_then(Value::as_str) == Some(id))
    }

    /// Fails if another record already holds `doc`'s unique key.
    fn check_unique(&self, id: &str, doc: &Document) -> StoreResult<()> {
        let key = self.kind.unique_key();
        if key.is_empty() || key.iter().any(|f| doc.get(*f).map_or(true, Value::is_null)) {
            return Ok(());
        }
        let taken = self.docs.iter().any(|other| {
            other.get("id").and_then(Value::as_str) != Some(id)
                && key.iter().all(|f| other.get(*f) == doc.get(*f))
        });
        if taken {
            return Err(StoreError::Conflict(format!(
                "{} ({}) already taken",
                self.kind.table(),
                key.join(", ")
            )));
        }
        Ok(())
    }

    /// Rewrites the whole file, then releases the lock.
    pub async fn commit(self) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(&self.docs).map_err(StoreError::decode)?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = self.docs.len(), "collection written");
        Ok(())
    }
}

/// Missing file reads as an empty collection.
async fn read_collection(path: &Path, kind: RecordKind) -> StoreResult<Vec<Document>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let docs: Vec<Document> = serde_json::from_slice(&raw).map_err(StoreError::decode)?;
    Ok(docs
        .iter()
        .map(|d| naming::to_canonical_form(d, kind, Convention::Snake))
        .collect())
}

fn created_at(doc: &Document) -> Option<OffsetDateTime> {
    doc.get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

fn matches(doc: &Document, filter: &[(&'static str, String)]) -> bool {
    filter
        .iter()
        .all(|(field, want)| doc.get(*field).and_then(Value::as_str) == Some(want.as_str()))
}

#[async_trait]
impl DocumentBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn upsert(&self, kind: RecordKind, doc: Document) -> StoreResult<Document> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Validation("record id must be a string".into()))?
            .to_string();

        let mut tx = self.begin(kind).await?;
        tx.check_unique(&id, &doc)?;
        match tx.position(&id) {
            Some(idx) => tx.docs_mut()[idx] = doc.clone(),
            None => tx.docs_mut().push(doc.clone()),
        }
        tx.commit().await?;
        Ok(doc)
    }

    async fn get(&self, kind: RecordKind, id: &str) -> StoreResult<Option<Document>> {
        let docs = read_collection(&self.path(kind), kind).await?;
        Ok(docs
            .into_iter()
            .find(|d| d.get("id").and_then(Value::as_str) == Some(id)))
    }

    async fn find_by(&self, kind: RecordKind, filter: &[(&'static str, String)]) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = read_collection(&self.path(kind), kind)
            .await?
            .into_iter()
            .filter(|d| matches(d, filter))
            .collect();
        // Later entries first so equal timestamps keep insertion recency.
        docs.reverse();
        docs.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
        Ok(docs)
    }

    async fn patch(&self, kind: RecordKind, id: &str, changes: Document) -> StoreResult<Option<Document>> {
        let mut tx = self.begin(kind).await?;
        let Some(idx) = tx.position(id) else {
            return Ok(None);
        };
        let mut updated = tx.docs_mut()[idx].clone();
        for (key, value) in changes {
            if key != "id" {
                updated.insert(key, value);
            }
        }
        tx.check_unique(id, &updated)?;
        tx.docs_mut()[idx] = updated.clone();
        tx.commit().await?;
        Ok(Some(updated))
    }
}
