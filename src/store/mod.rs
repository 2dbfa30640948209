//! Record store for accounts and QR codes.
//!
//! The backend is picked once in [`Store::connect`]: PostgreSQL when a
//! connection string is configured, JSON files otherwise. Both backends speak
//! canonical (snake_case) documents; the typed [`Collection`] layer converts
//! records to and from documents through [`naming`] on every call.

use std::{future::Future, marker::PhantomData, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod file;
pub mod model;
pub mod naming;
pub mod postgres;

pub use model::{Account, AccountPatch, QrCode, QrCodePatch, Record, RecordKind};
use naming::Convention;

/// A record in canonical snake_case form.
pub type Document = Map<String, Value>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The relational backend is unreachable or rejected the operation.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(#[from] sqlx::Error),
    /// File backend read/write failure, or a stored record that cannot be decoded.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("validation error: {0}")]
    Validation(String),
    /// A write collided with a unique key held by another record.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("undecodable record: {err}"),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    File,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::File => "file",
        }
    }
}

/// Storage side of the application config.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub op_timeout: Duration,
}

/// Document-level operations a backend provides. Returned documents are in
/// canonical form; `find_by` results are newest-created first.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert or replace by `id`.
    async fn upsert(&self, kind: RecordKind, doc: Document) -> StoreResult<Document>;

    async fn get(&self, kind: RecordKind, id: &str) -> StoreResult<Option<Document>>;

    /// All documents whose fields equal every `(field, value)` pair.
    async fn find_by(&self, kind: RecordKind, filter: &[(&'static str, String)]) -> StoreResult<Vec<Document>>;

    /// Overwrite only the fields present in `changes`.
    async fn patch(&self, kind: RecordKind, id: &str, changes: Document) -> StoreResult<Option<Document>>;
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn DocumentBackend>,
    pool: Option<PgPool>,
    timeout: Duration,
}

impl Store {
    /// Builds the store for the configured backend. An unreachable database
    /// does not fail startup; operations report it instead.
    pub async fn connect(cfg: &StoreConfig) -> anyhow::Result<Self> {
        match cfg.database_url.as_deref() {
            Some(url) => {
                let backend = postgres::PgBackend::connect_lazy(url, cfg.max_connections, cfg.acquire_timeout)?;
                match tokio::time::timeout(cfg.op_timeout, backend.ping()).await {
                    Ok(Ok(())) => info!("postgres storage reachable"),
                    Ok(Err(e)) => warn!(error = %e, "postgres unreachable at startup; operations will report unavailability"),
                    Err(_) => warn!(timeout = ?cfg.op_timeout, "postgres ping timed out at startup"),
                }
                let pool = backend.pool().clone();
                Ok(Self {
                    backend: Arc::new(backend),
                    pool: Some(pool),
                    timeout: cfg.op_timeout,
                })
            }
            None => {
                warn!(dir = %cfg.data_dir.display(), "DATABASE_URL not set; using file storage");
                Ok(Self::from_backend(Arc::new(file::FileBackend::new(&cfg.data_dir)), cfg.op_timeout))
            }
        }
    }

    pub fn from_backend(backend: Arc<dyn DocumentBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            pool: None,
            timeout,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Pool shared with the session store when running on PostgreSQL.
    pub fn pg_pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Same store with a different per-operation deadline.
    #[cfg(test)]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn accounts(&self) -> Collection<'_, Account> {
        Collection::new(self)
    }

    pub fn qrcodes(&self) -> Collection<'_, QrCode> {
        Collection::new(self)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

/// Typed view of one collection.
pub struct Collection<'a, E> {
    store: &'a Store,
    _record: PhantomData<E>,
}

impl<'a, E: Record> Collection<'a, E> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    pub async fn create(&self, record: &E) -> StoreResult<E> {
        record.validate()?;
        let doc = encode(record)?;
        let stored = self
            .store
            .bounded(self.store.backend.upsert(E::KIND, doc))
            .await?;
        debug!(kind = ?E::KIND, id = record.id(), "record stored");
        decode(stored)
    }

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        self.store
            .bounded(self.store.backend.get(E::KIND, id))
            .await?
            .map(decode)
            .transpose()
    }

    /// Records owned by `owner_id`, newest first.
    pub async fn find_by_owner(&self, owner_id: &str) -> StoreResult<Vec<E>> {
        let filter = [(E::KIND.owner_field(), owner_id.to_string())];
        self.store
            .bounded(self.store.backend.find_by(E::KIND, &filter))
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn update(&self, id: &str, patch: &E::Patch) -> StoreResult<Option<E>> {
        let value = serde_json::to_value(patch).map_err(StoreError::decode)?;
        let changes = match value {
            Value::Object(map) => naming::canonicalize_partial(&map, E::KIND, Convention::Snake),
            _ => Document::new(),
        };
        if changes.is_empty() {
            return self.find_by_id(id).await;
        }
        self.store
            .bounded(self.store.backend.patch(E::KIND, id, changes))
            .await?
            .map(decode)
            .transpose()
    }
}

impl Collection<'_, Account> {
    pub async fn find_by_external_identity(&self, provider: &str, subject: &str) -> StoreResult<Option<Account>> {
        let filter = [
            ("provider", provider.to_string()),
            ("provider_id", subject.to_string()),
        ];
        let found = self
            .store
            .bounded(self.store.backend.find_by(RecordKind::Account, &filter))
            .await?;
        if found.len() > 1 {
            warn!(provider, subject, count = found.len(), "duplicate accounts for external identity");
        }
        found.into_iter().next().map(decode).transpose()
    }
}

impl Collection<'_, QrCode> {
    /// Raises the manual-expiry flag. Repeating it is a no-op.
    pub async fn expire(&self, id: &str) -> StoreResult<Option<QrCode>> {
        self.update(id, &QrCodePatch::expire()).await
    }
}

/// Current time cut to whole microseconds, the precision PostgreSQL keeps,
/// so a timestamp reads back the same from either backend.
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

fn encode<E: Record>(record: &E) -> StoreResult<Document> {
    match serde_json::to_value(record).map_err(StoreError::decode)? {
        Value::Object(map) => Ok(naming::to_canonical_form(&map, E::KIND, Convention::Snake)),
        other => Err(StoreError::decode(format!("expected object, got {other}"))),
    }
}

fn decode<E: Record>(doc: Document) -> StoreResult<E> {
    let canonical = naming::to_canonical_form(&doc, E::KIND, Convention::Snake);
    serde_json::from_value(Value::Object(canonical)).map_err(StoreError::decode)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    /// Fresh, not yet created directory under the system temp dir.
    pub fn temp_dir(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{macros::datetime, Duration as TimeDuration};

    fn file_store() -> Store {
        let dir = test_support::temp_dir("qr-store");
        Store::from_backend(Arc::new(file::FileBackend::new(&dir)), Duration::from_secs(5))
    }

    fn qr(id: &str, owner: &str, created_at: time::OffsetDateTime) -> QrCode {
        QrCode {
            id: id.into(),
            user_id: owner.into(),
            url: "https://example.com".into(),
            description: Some("menu".into()),
            qr_code_data_url: "data:image/png;base64,AAAA".into(),
            created_at,
            expires_at: Some(created_at + TimeDuration::hours(1)),
            is_manually_expired: false,
        }
    }

    #[tokio::test]
    async fn create_then_find_returns_every_field() {
        let store = file_store();
        let record = qr("q1", "u1", datetime!(2024-05-01 10:00 UTC));

        let created = store.qrcodes().create(&record).await.unwrap();
        assert_eq!(created, record);

        let found = store.qrcodes().find_by_id("q1").await.unwrap();
        assert_eq!(found, Some(record));
        assert!(store.qrcodes().find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_and_not_persisted() {
        let store = file_store();
        let mut record = qr("q1", "u1", datetime!(2024-05-01 10:00 UTC));
        record.url = "definitely not a url".into();

        let err = store.qrcodes().create(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(store.qrcodes().find_by_id("q1").await.unwrap().is_none());
        assert!(store.qrcodes().find_by_owner("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn description_update_keeps_expiry() {
        let store = file_store();
        let record = qr("q1", "u1", datetime!(2024-05-01 10:00 UTC));
        store.qrcodes().create(&record).await.unwrap();

        let patch = QrCodePatch {
            description: Some(Some("new menu".into())),
            ..QrCodePatch::default()
        };
        let updated = store.qrcodes().update("q1", &patch).await.unwrap().unwrap();

        assert_eq!(updated.description.as_deref(), Some("new menu"));
        assert_eq!(updated.expires_at, record.expires_at);
        assert_eq!(updated.qr_code_data_url, record.qr_code_data_url);
        assert!(!updated.is_manually_expired);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_none() {
        let store = file_store();
        let res = store.qrcodes().expire("nope").await.unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn expire_is_idempotent() {
        let store = file_store();
        store
            .qrcodes()
            .create(&qr("q1", "u1", datetime!(2024-05-01 10:00 UTC)))
            .await
            .unwrap();

        let once = store.qrcodes().expire("q1").await.unwrap().unwrap();
        let twice = store.qrcodes().expire("q1").await.unwrap().unwrap();

        assert!(once.is_manually_expired);
        assert_eq!(once, twice);
        assert_eq!(store.qrcodes().find_by_id("q1").await.unwrap(), Some(twice));
    }

    #[tokio::test]
    async fn owner_listing_is_newest_first() {
        let store = file_store();
        let codes = store.qrcodes();
        codes.create(&qr("old", "u1", datetime!(2024-05-01 08:00 UTC))).await.unwrap();
        codes.create(&qr("new", "u1", datetime!(2024-05-01 12:00 UTC))).await.unwrap();
        codes.create(&qr("mid", "u1", datetime!(2024-05-01 10:00 UTC))).await.unwrap();
        codes.create(&qr("other", "u2", datetime!(2024-05-01 11:00 UTC))).await.unwrap();

        let ids: Vec<_> = codes
            .find_by_owner("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert!(codes.find_by_owner("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_identity_lookup() {
        let store = file_store();
        let account = Account {
            id: "A1".into(),
            email: "a@x.com".into(),
            name: "A".into(),
            avatar: None,
            provider: "google".into(),
            provider_id: "sub-123".into(),
            created_at: datetime!(2024-05-01 10:00 UTC),
        };
        store.accounts().create(&account).await.unwrap();

        let found = store
            .accounts()
            .find_by_external_identity("google", "sub-123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "A1");
        assert_eq!(found.email, "a@x.com");
        assert!(store
            .accounts()
            .find_by_external_identity("github", "sub-123")
            .await
            .unwrap()
            .is_none());

        let own = store.accounts().find_by_owner("A1").await.unwrap();
        assert_eq!(own, vec![account]);
    }

    #[tokio::test]
    async fn second_account_for_same_identity_is_a_conflict() {
        let store = file_store();
        let first = Account {
            id: "A1".into(),
            email: "a@x.com".into(),
            name: "A".into(),
            avatar: None,
            provider: "google".into(),
            provider_id: "sub-123".into(),
            created_at: datetime!(2024-05-01 10:00 UTC),
        };
        store.accounts().create(&first).await.unwrap();

        let dup = Account {
            id: "other-id".into(),
            ..first.clone()
        };
        let err = store.accounts().create(&dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.accounts().find_by_id("other-id").await.unwrap().is_none());

        // Rewriting the holder of the identity is still fine.
        let renamed = Account {
            email: "a2@x.com".into(),
            ..first
        };
        assert_eq!(store.accounts().create(&renamed).await.unwrap().email, "a2@x.com");
    }

    #[tokio::test]
    async fn store_clock_round_trips_through_files() {
        let now = now_utc();
        assert_eq!(now.nanosecond() % 1_000, 0);

        let store = file_store();
        store.qrcodes().create(&qr("q1", "u1", now)).await.unwrap();
        let found = store.qrcodes().find_by_id("q1").await.unwrap().unwrap();
        assert_eq!(found.created_at, now);
    }

    struct SlowBackend;

    #[async_trait]
    impl DocumentBackend for SlowBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Postgres
        }
        async fn upsert(&self, _kind: RecordKind, doc: Document) -> StoreResult<Document> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(doc)
        }
        async fn get(&self, _kind: RecordKind, _id: &str) -> StoreResult<Option<Document>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(None)
        }
        async fn find_by(&self, _kind: RecordKind, _f: &[(&'static str, String)]) -> StoreResult<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn patch(&self, _kind: RecordKind, _id: &str, _c: Document) -> StoreResult<Option<Document>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let store = Store::from_backend(Arc::new(SlowBackend), Duration::from_secs(5))
            .with_timeout(Duration::from_millis(10));

        let err = store.qrcodes().find_by_id("q1").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(d) if d == Duration::from_millis(10)));

        let err = store
            .qrcodes()
            .create(&qr("q1", "u1", datetime!(2024-05-01 10:00 UTC)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));

        assert!(store.qrcodes().find_by_owner("u1").await.unwrap().is_empty());
    }
}
