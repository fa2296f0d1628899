//! Upload Session Store
//!
//! Durable record of every upload session. The compare-and-advance
//! primitive is atomic on its own, so a retried or reordered chunk can never
//! be applied twice even if two callers slip past the concurrency guard.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::metadata::Metadata;
use super::types::{StorageLocator, UploadError, UploadSession, UploadState, ValidationError};

// ============================================================================
// Store Trait
// ============================================================================

/// Session store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("session {0} already exists")]
    AlreadyExists(Uuid),

    /// The caller's view of the session is stale
    #[error("offset conflict: expected {expected}, store has {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("session {id} is {state}")]
    Finalized { id: Uuid, state: UploadState },

    #[error("length already fixed at {0}")]
    LengthAlreadyFixed(u64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => UploadError::NotFound(id.to_string()),
            StoreError::Conflict { expected, current } => UploadError::OffsetMismatch {
                expected: current,
                provided: expected,
            },
            StoreError::Finalized { id, state } => UploadError::ConflictFinalized { id, state },
            StoreError::LengthAlreadyFixed(length) => {
                UploadError::Validation(ValidationError::LengthAlreadyFixed(length))
            }
            StoreError::Database(e) => UploadError::BackendTransient(e.to_string()),
            e @ (StoreError::AlreadyExists(_) | StoreError::Corrupt(_)) => {
                UploadError::BackendPermanent(e.to_string())
            }
        }
    }
}

/// Trait for session persistence backends
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session; fails if the ID is taken
    async fn create(&self, session: &UploadSession) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<UploadSession, StoreError>;

    /// Atomically move the offset from `expected` to `new_offset`.
    ///
    /// Fails with `Conflict` if the stored offset is not `expected` and with
    /// `Finalized` if the session is terminal. A successful advance leaves
    /// the session `InProgress`.
    async fn compare_and_advance_offset(
        &self,
        id: Uuid,
        expected: u64,
        new_offset: u64,
    ) -> Result<UploadSession, StoreError>;

    /// Fix a deferred length. Fails if already fixed or below the offset.
    async fn declare_length(&self, id: Uuid, length: u64) -> Result<UploadSession, StoreError>;

    /// Record completion; the metadata rewrite and the state change are one write
    async fn mark_completed(
        &self,
        id: Uuid,
        metadata: &Metadata,
        final_object: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<UploadSession, StoreError>;

    async fn mark_terminated(&self, id: Uuid) -> Result<UploadSession, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Sessions in any state last updated before `cutoff`
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, StoreError>;

    /// Sessions that are neither completed nor terminated
    async fn list_active(&self) -> Result<Vec<UploadSession>, StoreError>;
}

/// Shared precondition check for stores that inspect the record directly
fn ensure_active(session: &UploadSession) -> Result<(), StoreError> {
    if session.is_terminal() {
        return Err(StoreError::Finalized {
            id: session.id,
            state: session.state,
        });
    }
    Ok(())
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Process-local store; sessions do not survive a restart
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<UploadSession, StoreError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn compare_and_advance_offset(
        &self,
        id: Uuid,
        expected: u64,
        new_offset: u64,
    ) -> Result<UploadSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        ensure_active(session)?;

        if session.offset != expected {
            return Err(StoreError::Conflict {
                expected,
                current: session.offset,
            });
        }
        if let Some(total) = session.total_length {
            if new_offset > total {
                return Err(StoreError::Corrupt(format!(
                    "offset {} past length {} for {}",
                    new_offset, total, id
                )));
            }
        }

        session.offset = new_offset;
        session.state = UploadState::InProgress;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn declare_length(&self, id: Uuid, length: u64) -> Result<UploadSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        ensure_active(session)?;

        if let Some(total) = session.total_length {
            return Err(StoreError::LengthAlreadyFixed(total));
        }
        if length < session.offset {
            return Err(StoreError::Conflict {
                expected: length,
                current: session.offset,
            });
        }

        session.total_length = Some(length);
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        metadata: &Metadata,
        final_object: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<UploadSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        ensure_active(session)?;

        if !session.is_fully_received() {
            return Err(StoreError::Conflict {
                expected: session.total_length.unwrap_or_default(),
                current: session.offset,
            });
        }

        session.state = UploadState::Completed;
        session.metadata = metadata.clone();
        session.final_object = Some(final_object.to_string());
        session.completed_at = Some(completed_at);
        session.updated_at = completed_at;
        Ok(session.clone())
    }

    async fn mark_terminated(&self, id: Uuid) -> Result<UploadSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        ensure_active(session)?;

        session.state = UploadState::Terminated;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<UploadSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

const SESSION_COLUMNS: &str = "id, total_length, upload_offset, metadata, storage_locator, \
                               final_object, state, created_at, updated_at, completed_at";

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", value, e)))
}

/// Raw `upload_sessions` row
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    total_length: Option<i64>,
    upload_offset: i64,
    metadata: String,
    storage_locator: String,
    final_object: Option<String>,
    state: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| StoreError::Corrupt(format!("bad id {:?}: {}", row.id, e)))?;
        let state = UploadState::parse(&row.state)
            .ok_or_else(|| StoreError::Corrupt(format!("bad state {:?} for {}", row.state, id)))?;
        let metadata: Metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| StoreError::Corrupt(format!("bad metadata for {}: {}", id, e)))?;

        Ok(UploadSession {
            id,
            total_length: row.total_length.map(|l| l as u64),
            offset: row.upload_offset as u64,
            metadata,
            storage_locator: StorageLocator::new(row.storage_locator),
            state,
            final_object: row.final_object,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// SQLite-backed store; one table shared by all mounts, rows scoped by mount
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    mount: String,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool, mount: impl Into<String>) -> Self {
        Self {
            pool,
            mount: mount.into(),
        }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<UploadSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ? AND mount = ?",
            SESSION_COLUMNS
        ))
        .bind(id.to_string())
        .bind(&self.mount)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadSession::try_from).transpose()
    }

    /// Explain why a conditional update touched no row
    async fn diagnose(
        &self,
        id: Uuid,
        check: impl FnOnce(&UploadSession) -> StoreError,
    ) -> StoreError {
        match self.fetch(id).await {
            Ok(None) => StoreError::NotFound(id),
            Ok(Some(session)) if session.is_terminal() => StoreError::Finalized {
                id,
                state: session.state,
            },
            Ok(Some(session)) => check(&session),
            Err(e) => e,
        }
    }

    async fn fetch_updated(&self, id: Uuid) -> Result<UploadSession, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &UploadSession) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&session.metadata)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, mount, total_length, upload_offset, metadata,
                storage_locator, final_object, state, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&self.mount)
        .bind(session.total_length.map(|l| l as i64))
        .bind(session.offset as i64)
        .bind(metadata)
        .bind(session.storage_locator.as_str())
        .bind(session.final_object.as_deref())
        .bind(session.state.as_str())
        .bind(timestamp(session.created_at))
        .bind(timestamp(session.updated_at))
        .bind(session.completed_at.map(timestamp))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyExists(session.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<UploadSession, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn compare_and_advance_offset(
        &self,
        id: Uuid,
        expected: u64,
        new_offset: u64,
    ) -> Result<UploadSession, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET upload_offset = ?, state = 'in_progress', updated_at = ?
            WHERE id = ? AND mount = ?
              AND upload_offset = ?
              AND state IN ('created', 'in_progress')
              AND (total_length IS NULL OR total_length >= ?)
            "#,
        )
        .bind(new_offset as i64)
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .bind(&self.mount)
        .bind(expected as i64)
        .bind(new_offset as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .diagnose(id, |session| {
                    if session.offset != expected {
                        StoreError::Conflict {
                            expected,
                            current: session.offset,
                        }
                    } else {
                        StoreError::Corrupt(format!(
                            "offset {} past length {:?} for {}",
                            new_offset, session.total_length, id
                        ))
                    }
                })
                .await);
        }

        self.fetch_updated(id).await
    }

    async fn declare_length(&self, id: Uuid, length: u64) -> Result<UploadSession, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET total_length = ?, updated_at = ?
            WHERE id = ? AND mount = ?
              AND total_length IS NULL
              AND upload_offset <= ?
              AND state IN ('created', 'in_progress')
            "#,
        )
        .bind(length as i64)
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .bind(&self.mount)
        .bind(length as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .diagnose(id, |session| match session.total_length {
                    Some(total) => StoreError::LengthAlreadyFixed(total),
                    None => StoreError::Conflict {
                        expected: length,
                        current: session.offset,
                    },
                })
                .await);
        }

        self.fetch_updated(id).await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        metadata: &Metadata,
        final_object: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<UploadSession, StoreError> {
        let metadata =
            serde_json::to_string(metadata).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let completed_at = timestamp(completed_at);

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET state = 'completed', metadata = ?, final_object = ?,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND mount = ?
              AND state IN ('created', 'in_progress')
              AND total_length IS NOT NULL
              AND upload_offset = total_length
            "#,
        )
        .bind(metadata)
        .bind(final_object)
        .bind(&completed_at)
        .bind(&completed_at)
        .bind(id.to_string())
        .bind(&self.mount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .diagnose(id, |session| StoreError::Conflict {
                    expected: session.total_length.unwrap_or_default(),
                    current: session.offset,
                })
                .await);
        }

        self.fetch_updated(id).await
    }

    async fn mark_terminated(&self, id: Uuid) -> Result<UploadSession, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET state = 'terminated', updated_at = ?
            WHERE id = ? AND mount = ? AND state IN ('created', 'in_progress')
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .bind(&self.mount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .diagnose(id, |session| {
                    StoreError::Corrupt(format!("session {} could not be terminated", session.id))
                })
                .await);
        }

        self.fetch_updated(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ? AND mount = ?")
            .bind(id.to_string())
            .bind(&self.mount)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE mount = ? AND updated_at < ? ORDER BY updated_at ASC",
            SESSION_COLUMNS
        ))
        .bind(&self.mount)
        .bind(timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadSession::try_from).collect()
    }

    async fn list_active(&self) -> Result<Vec<UploadSession>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE mount = ? AND state IN ('created', 'in_progress') \
             ORDER BY created_at ASC",
            SESSION_COLUMNS
        ))
        .bind(&self.mount)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadSession::try_from).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn session(total: Option<u64>) -> UploadSession {
        let metadata: Metadata = [("propertyId", "p1")].into_iter().collect();
        UploadSession::new(Uuid::new_v4(), total, metadata, StorageLocator::new("p1/x"))
    }

    async fn sqlite_store(temp_dir: &TempDir, mount: &str) -> SqliteSessionStore {
        let url = format!("sqlite://{}", temp_dir.path().join("sessions.db").display());
        let pool = crate::db::create_pool(&url).await.unwrap();
        SqliteSessionStore::new(pool, mount)
    }

    /// Behaviour shared by every store implementation
    async fn exercise_store(store: &dyn SessionStore) {
        let s = session(Some(10));
        store.create(&s).await.unwrap();
        assert!(matches!(
            store.create(&s).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let loaded = store.get(s.id).await.unwrap();
        assert_eq!(loaded.offset, 0);
        assert_eq!(loaded.state, UploadState::Created);
        assert_eq!(loaded.metadata.get("propertyId"), Some("p1"));

        let advanced = store.compare_and_advance_offset(s.id, 0, 6).await.unwrap();
        assert_eq!(advanced.offset, 6);
        assert_eq!(advanced.state, UploadState::InProgress);

        // A retry of the first chunk is refused and changes nothing
        assert!(matches!(
            store.compare_and_advance_offset(s.id, 0, 6).await,
            Err(StoreError::Conflict { expected: 0, current: 6 })
        ));
        assert_eq!(store.get(s.id).await.unwrap().offset, 6);

        // Not yet fully received
        assert!(store
            .mark_completed(s.id, &Metadata::new(), "p1/x", Utc::now())
            .await
            .is_err());

        store.compare_and_advance_offset(s.id, 6, 10).await.unwrap();
        let mut rewritten = loaded.metadata.clone();
        rewritten.insert("size", "10");
        let completed = store
            .mark_completed(s.id, &rewritten, "p1/x", Utc::now())
            .await
            .unwrap();
        assert_eq!(completed.state, UploadState::Completed);
        assert_eq!(completed.final_object.as_deref(), Some("p1/x"));
        assert_eq!(completed.metadata.get("size"), Some("10"));
        assert!(completed.completed_at.is_some());

        assert!(matches!(
            store.compare_and_advance_offset(s.id, 10, 11).await,
            Err(StoreError::Finalized { state: UploadState::Completed, .. })
        ));
        assert!(matches!(
            store.mark_terminated(s.id).await,
            Err(StoreError::Finalized { .. })
        ));

        assert!(store.list_active().await.unwrap().is_empty());
        store.delete(s.id).await.unwrap();
        assert!(matches!(store.get(s.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(s.id).await, Err(StoreError::NotFound(_))));
    }

    async fn exercise_deferred_length(store: &dyn SessionStore) {
        let s = session(None);
        store.create(&s).await.unwrap();
        store.compare_and_advance_offset(s.id, 0, 4).await.unwrap();

        assert!(matches!(
            store.declare_length(s.id, 3).await,
            Err(StoreError::Conflict { expected: 3, current: 4 })
        ));

        let fixed = store.declare_length(s.id, 8).await.unwrap();
        assert_eq!(fixed.total_length, Some(8));
        assert!(matches!(
            store.declare_length(s.id, 9).await,
            Err(StoreError::LengthAlreadyFixed(8))
        ));

        let terminated = store.mark_terminated(s.id).await.unwrap();
        assert_eq!(terminated.state, UploadState::Terminated);
        assert!(matches!(
            store.compare_and_advance_offset(s.id, 4, 8).await,
            Err(StoreError::Finalized { state: UploadState::Terminated, .. })
        ));
    }

    async fn exercise_listing(store: &dyn SessionStore) {
        let a = session(Some(5));
        let b = session(Some(5));
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store.mark_terminated(b.id).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.list_stale(future).await.unwrap().len(), 2);
        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store.list_stale(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        exercise_store(&store).await;
        exercise_deferred_length(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store_listing() {
        exercise_listing(&MemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = sqlite_store(&temp_dir, "files").await;
        exercise_store(&store).await;
        exercise_deferred_length(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_listing() {
        let temp_dir = TempDir::new().unwrap();
        exercise_listing(&sqlite_store(&temp_dir, "files").await).await;
    }

    #[tokio::test]
    async fn test_sqlite_rows_scoped_by_mount() {
        let temp_dir = TempDir::new().unwrap();
        let files = sqlite_store(&temp_dir, "files").await;
        let inventory = SqliteSessionStore::new(files.pool.clone(), "agentInventoryUpload");

        let s = session(Some(3));
        files.create(&s).await.unwrap();

        assert!(files.get(s.id).await.is_ok());
        assert!(matches!(inventory.get(s.id).await, Err(StoreError::NotFound(_))));
        assert!(inventory.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let s = session(None);
        {
            let store = sqlite_store(&temp_dir, "files").await;
            store.create(&s).await.unwrap();
            store.compare_and_advance_offset(s.id, 0, 7).await.unwrap();
            store.pool.close().await;
        }

        let store = sqlite_store(&temp_dir, "files").await;
        let loaded = store.get(s.id).await.unwrap();
        assert_eq!(loaded.offset, 7);
        assert_eq!(loaded.total_length, None);
        assert_eq!(loaded.state, UploadState::InProgress);
    }

    #[tokio::test]
    async fn test_concurrent_advance_applies_once() {
        let store = Arc::new(MemorySessionStore::new());
        let s = session(Some(10));
        store.create(&s).await.unwrap();
        let id = s.id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.compare_and_advance_offset(id, 0, 5).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(store.get(id).await.unwrap().offset, 5);
    }

    #[test]
    fn test_error_mapping() {
        let id = Uuid::new_v4();
        assert!(matches!(
            UploadError::from(StoreError::Conflict { expected: 0, current: 6 }),
            UploadError::OffsetMismatch { expected: 6, provided: 0 }
        ));
        assert!(matches!(
            UploadError::from(StoreError::NotFound(id)),
            UploadError::NotFound(_)
        ));
        assert!(matches!(
            UploadError::from(StoreError::Finalized { id, state: UploadState::Completed }),
            UploadError::ConflictFinalized { .. }
        ));
    }
}
