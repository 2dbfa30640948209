//! Server-side session records.
//!
//! The signed cookie only names a session; whether it is still live is
//! decided here, which is what makes logout effective.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Session {
    pub sid: String,
    pub account_id: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl Session {
    pub fn new(account_id: &str, ttl: time::Duration) -> Self {
        let sid: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(43)
            .map(char::from)
            .collect();
        let now = OffsetDateTime::now_utc();
        Self {
            sid,
            account_id: account_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn create(&self, session: &Session) -> anyhow::Result<()>;
    /// Live session for `sid`; expired sessions read as absent.
    async fn get(&self, sid: &str) -> anyhow::Result<Option<Session>>;
    async fn delete(&self, sid: &str) -> anyhow::Result<()>;
    async fn prune_expired(&self) -> anyhow::Result<u64>;
}

/// Sessions in the `sessions` table, sharing the record store's pool.
pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn create(&self, session: &Session) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (sid, account_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sid) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&session.sid)
        .bind(&session.account_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, sid: &str) -> anyhow::Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT sid, account_id, created_at, expires_at
            FROM sessions
            WHERE sid = $1 AND expires_at > now()
            "#,
        )
        .bind(sid)
        .fetch_optional(&self.db)
        .await?;
        Ok(session)
    }

    async fn delete(&self, sid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE sid = $1")
            .bind(sid)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn prune_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= now()")
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}

/// Process-local sessions. Every instance has its own map, so a user logged
/// in on one instance is anonymous on the next.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.sid.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, sid: &str) -> anyhow::Result<Option<Session>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .sessions
            .read()
            .await
            .get(sid)
            .filter(|s| s.is_live_at(now))
            .cloned())
    }

    async fn delete(&self, sid: &str) -> anyhow::Result<()> {
        self.sessions.write().await.remove(sid);
        Ok(())
    }

    async fn prune_expired(&self) -> anyhow::Result<u64> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.is_live_at(now));
        Ok((before - sessions.len()) as u64)
    }
}

/// Session store matching the record store backend.
pub fn for_pool(pool: Option<&PgPool>, production: bool) -> Arc<dyn SessionStore> {
    match pool {
        Some(pool) => {
            info!("using postgres session store");
            Arc::new(PgSessionStore::new(pool.clone()))
        }
        None => {
            if production {
                error!("no database configured in production; sessions will not survive restarts or span instances");
            } else {
                warn!("using in-memory session store (development only)");
            }
            Arc::new(MemorySessionStore::new())
        }
    }
}

/// Drops expired sessions every `every` until the runtime shuts down.
pub fn spawn_pruner(store: Arc<dyn SessionStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match store.prune_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(pruned = n, "expired sessions removed"),
                Err(e) => warn!(error = %e, "session prune failed"),
            }
        }
    })
}
