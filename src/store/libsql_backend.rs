//! libSQL backend: durable `ContextStore` implementation.
//!
//! Turns are stored one row each, ordered per user by a monotonically
//! increasing `seq`. Eviction deletes the lowest `seq` rows.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ContextBounds;
use crate::error::ContextStoreError;
use crate::store::migrations;
use crate::store::traits::{ContextStore, Transcript, Turn};

/// libSQL context store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlContextStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    bounds: ContextBounds,
    /// Serializes append (insert + evict) so sequence numbers never collide.
    write_lock: Mutex<()>,
}

impl LibSqlContextStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, bounds: ContextBounds) -> Result<Self, ContextStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ContextStoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            ContextStoreError::Connection(format!("Failed to open libSQL database: {e}"))
        })?;

        let store = Self::from_database(db, bounds).await?;
        info!(path = %path.display(), "Context store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(bounds: ContextBounds) -> Result<Self, ContextStoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                ContextStoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, bounds).await
    }

    async fn from_database(
        db: LibSqlDatabase,
        bounds: ContextBounds,
    ) -> Result<Self, ContextStoreError> {
        let conn = db.connect().map_err(|e| {
            ContextStoreError::Connection(format!("Failed to create connection: {e}"))
        })?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            bounds,
            write_lock: Mutex::new(()),
        })
    }
}

async fn next_seq(conn: &Connection, user_id: &str) -> Result<i64, ContextStoreError> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_turns WHERE user_id = ?1",
            params![user_id],
        )
        .await
        .map_err(|e| ContextStoreError::Query(format!("next_seq: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| ContextStoreError::Query(format!("next_seq: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| ContextStoreError::Query(format!("next_seq: {e}"))),
        None => Ok(1),
    }
}

async fn load_turns(conn: &Connection, user_id: &str) -> Result<Transcript, ContextStoreError> {
    let mut rows = conn
        .query(
            "SELECT input, response FROM conversation_turns
             WHERE user_id = ?1 ORDER BY seq ASC",
            params![user_id],
        )
        .await
        .map_err(|e| ContextStoreError::Query(format!("get: {e}")))?;

    let mut turns = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| ContextStoreError::Query(format!("get: {e}")))?
    {
        let input: String = row
            .get(0)
            .map_err(|e| ContextStoreError::Query(format!("get input: {e}")))?;
        let response: String = row
            .get(1)
            .map_err(|e| ContextStoreError::Query(format!("get response: {e}")))?;
        turns.push(Turn { input, response });
    }
    Ok(Transcript::from_turns(turns))
}

#[async_trait]
impl ContextStore for LibSqlContextStore {
    async fn get(&self, user_id: &str) -> Result<Transcript, ContextStoreError> {
        load_turns(&self.conn, user_id).await
    }

    /// Insert and evict in one transaction: either the turn is stored and
    /// the transcript fits the bounds, or nothing changes.
    async fn append(&self, user_id: &str, turn: &Turn) -> Result<(), ContextStoreError> {
        let _guard = self.write_lock.lock().await;

        // Rolled back on drop unless committed.
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| ContextStoreError::Query(format!("begin: {e}")))?;

        let seq = next_seq(&tx, user_id).await?;
        tx.execute(
            "INSERT INTO conversation_turns (id, user_id, seq, input, response, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                seq,
                turn.input.as_str(),
                turn.response.as_str(),
                Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| ContextStoreError::Query(format!("append: {e}")))?;

        let mut transcript = load_turns(&tx, user_id).await?;
        let evicted = transcript.evict_to(&self.bounds);
        if evicted > 0 {
            tx.execute(
                "DELETE FROM conversation_turns WHERE id IN (
                    SELECT id FROM conversation_turns
                    WHERE user_id = ?1 ORDER BY seq ASC LIMIT ?2
                 )",
                params![user_id, evicted as i64],
            )
            .await
            .map_err(|e| ContextStoreError::Query(format!("evict: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| ContextStoreError::Query(format!("commit: {e}")))?;
        if evicted > 0 {
            debug!(user_id, evicted, "Evicted oldest turns");
        }
        Ok(())
    }
}
