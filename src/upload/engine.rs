//! Protocol Engine
//!
//! Drives the upload state machine:
//! - create: validate metadata, run the create hook, allocate storage, store the session
//! - append: verify the offset, persist the chunk, advance the offset atomically
//! - finalize: compose parts, run the finish hook, mark the session completed
//! - terminate, expiry sweep and startup reconciliation
//!
//! Every mutation of an existing session runs under the per-ID guard.
//! Offset and state are checked once before the guard for cheap rejection
//! and again after it, where the check is authoritative.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::adapter::{AdapterError, StorageAdapter};
use super::guard::{ConcurrencyGuard, UploadLock};
use super::hooks::UploadHooks;
use super::metadata::MetadataSchema;
use super::store::{SessionStore, StoreError};
use super::types::{
    AppendChunk, AppendOutcome, ChunkChecksum, CreateUpload, LocatorHint, SweepReport,
    UploadError, UploadSession, UploadState, ValidationError,
};

impl From<AdapterError> for UploadError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(reason) => UploadError::BackendTransient(reason),
            AdapterError::Permanent(reason) => UploadError::BackendPermanent(reason),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything one mounted engine depends on
pub struct EngineConfig {
    /// Mount name, used in logs
    pub mount: String,
    pub adapter: Arc<dyn StorageAdapter>,
    pub store: Arc<dyn SessionStore>,
    pub hooks: Arc<dyn UploadHooks>,
    pub schema: MetadataSchema,
    /// Largest accepted upload length (`None` = unlimited)
    pub max_size: Option<u64>,
    /// Idle time before an unfinished session expires
    pub session_ttl: Duration,
    /// How long completed records stay queryable
    pub completed_retention: Duration,
}

// ============================================================================
// Protocol Engine
// ============================================================================

/// Resumable upload protocol engine for one mount
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    guard: ConcurrencyGuard,
}

impl ProtocolEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                guard: ConcurrencyGuard::new(),
            }),
        }
    }

    pub fn mount(&self) -> &str {
        &self.inner.config.mount
    }

    pub fn max_size(&self) -> Option<u64> {
        self.inner.config.max_size
    }

    /// When `session` expires if it stays idle
    pub fn expires_at(&self, session: &UploadSession) -> Option<DateTime<Utc>> {
        session.expires_at(self.inner.config.session_ttl)
    }

    fn adapter(&self) -> &dyn StorageAdapter {
        self.inner.config.adapter.as_ref()
    }

    fn store(&self) -> &dyn SessionStore {
        self.inner.config.store.as_ref()
    }

    fn hooks(&self) -> &dyn UploadHooks {
        self.inner.config.hooks.as_ref()
    }

    // ========================================================================
    // Create / Query
    // ========================================================================

    /// Create a new upload session.
    ///
    /// A rejection by validation or the create hook leaves no session and no
    /// storage behind. A zero-length upload is completed before returning.
    pub async fn create(&self, request: CreateUpload) -> Result<UploadSession, UploadError> {
        let config = &self.inner.config;

        if let (Some(length), Some(max)) = (request.length.fixed(), config.max_size) {
            if length > max {
                return Err(ValidationError::LengthExceedsMax { length, max }.into());
            }
        }
        config.schema.validate(&request.metadata)?;

        let id = Uuid::new_v4();
        let decision = self
            .hooks()
            .on_create(id, &request.metadata)
            .await
            .map_err(|rejection| {
                tracing::warn!(mount = %config.mount, upload_id = %id, reason = %rejection, "Upload creation rejected");
                UploadError::from(rejection)
            })?;

        let hint = LocatorHint {
            id,
            namespace: decision.namespace.clone(),
        };
        let locator = match self.adapter().allocate(&hint).await {
            Ok(locator) => locator,
            Err(e) => {
                tracing::warn!(mount = %config.mount, upload_id = %id, error = %e, "Storage allocation failed");
                self.hooks().on_create_aborted(&decision).await;
                return Err(e.into());
            }
        };

        let session = UploadSession::new(
            id,
            request.length.fixed(),
            decision.metadata.clone(),
            locator,
        );

        if let Err(e) = self.store().create(&session).await {
            tracing::warn!(mount = %config.mount, upload_id = %id, error = %e, "Session store write failed");
            if let Err(discard_err) = self.adapter().discard(&session.storage_locator).await {
                tracing::warn!(upload_id = %id, error = %discard_err, "Failed to discard allocated storage");
            }
            self.hooks().on_create_aborted(&decision).await;
            return Err(e.into());
        }

        tracing::info!(
            mount = %config.mount,
            upload_id = %id,
            length = ?session.total_length,
            locator = %session.storage_locator,
            "Created upload session"
        );

        if session.total_length == Some(0) {
            let lock = self.inner.guard.acquire(id).await;
            let completed = self.finalize_locked(&lock, session).await;
            self.release(lock, id);
            return completed;
        }

        Ok(session)
    }

    /// Current state of a session. Never mutates.
    pub async fn query(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        Ok(self.store().get(id).await?)
    }

    // ========================================================================
    // Append / Finalize
    // ========================================================================

    /// Append a chunk at the offset the client believes is current.
    ///
    /// An empty chunk persists nothing; it only finalizes a session whose
    /// bytes are all received (e.g. a deferred length declared at the
    /// current offset, or a completion retried after a transient failure).
    pub async fn append(&self, chunk: AppendChunk) -> Result<AppendOutcome, UploadError> {
        let id = chunk.id;

        let current = self.store().get(id).await?;
        self.check_append(&current, &chunk)?;
        if let Some(checksum) = &chunk.checksum {
            verify_checksum(checksum, &chunk.data)?;
        }

        let lock = self.inner.guard.acquire(id).await;
        let outcome = self.append_locked(&lock, chunk).await;
        self.release(lock, id);

        outcome
    }

    async fn append_locked(
        &self,
        lock: &UploadLock,
        chunk: AppendChunk,
    ) -> Result<AppendOutcome, UploadError> {
        let id = chunk.id;
        let mut session = self.store().get(id).await?;
        self.check_append(&session, &chunk)?;

        if let (None, Some(length)) = (session.total_length, chunk.declared_length) {
            session = self.store().declare_length(id, length).await?;
            tracing::info!(upload_id = %id, length, "Upload length declared");
        }

        if !chunk.data.is_empty() {
            let len = chunk.data.len() as u64;
            if let Err(e) = self
                .adapter()
                .write_chunk(&session.storage_locator, chunk.offset, chunk.data)
                .await
            {
                return Err(self.storage_failure(&session, e, "Chunk write failed").await);
            }

            session = self
                .store()
                .compare_and_advance_offset(id, chunk.offset, chunk.offset + len)
                .await?;

            tracing::debug!(
                upload_id = %id,
                offset = session.offset,
                length = ?session.total_length,
                chunk_bytes = len,
                "Chunk appended"
            );
        }

        if session.is_fully_received() {
            let session = self.finalize_locked(lock, session).await?;
            return Ok(AppendOutcome {
                session,
                completed: true,
            });
        }

        Ok(AppendOutcome {
            session,
            completed: false,
        })
    }

    /// Compose the parts, run the finish hook and mark the session completed.
    ///
    /// Requires the session's lock. A transient compose failure leaves the
    /// session untouched so a retry can finish it; any other failure
    /// terminates it and keeps whatever storage exists.
    async fn finalize_locked(
        &self,
        _lock: &UploadLock,
        session: UploadSession,
    ) -> Result<UploadSession, UploadError> {
        let id = session.id;
        let length = session.total_length.unwrap_or(session.offset);

        let object = match self.adapter().compose(&session.storage_locator, length).await {
            Ok(object) => object,
            Err(e) => return Err(self.storage_failure(&session, e, "Compose failed").await),
        };

        let metadata = match self.hooks().on_finish(&session, object.size).await {
            Ok(metadata) => metadata,
            Err(rejection) => {
                tracing::warn!(upload_id = %id, reason = %rejection, "Finish hook rejected upload");
                self.mark_failed(&session).await;
                return Err(rejection.into());
            }
        };

        let completed = self
            .store()
            .mark_completed(id, &metadata, &object.key, Utc::now())
            .await?;

        tracing::info!(
            mount = %self.inner.config.mount,
            upload_id = %id,
            size = object.size,
            object = %object.key,
            "Upload completed"
        );

        Ok(completed)
    }

    /// Stateless append checks, run both before and after taking the lock
    fn check_append(&self, session: &UploadSession, chunk: &AppendChunk) -> Result<(), UploadError> {
        if session.is_terminal() {
            return Err(UploadError::ConflictFinalized {
                id: session.id,
                state: session.state,
            });
        }
        if chunk.offset != session.offset {
            return Err(UploadError::OffsetMismatch {
                expected: session.offset,
                provided: chunk.offset,
            });
        }

        let len = chunk.data.len() as u64;
        let end = chunk.offset + len;

        let total = match (session.total_length, chunk.declared_length) {
            (Some(total), Some(declared)) if declared != total => {
                return Err(ValidationError::LengthAlreadyFixed(total).into());
            }
            (Some(total), _) => Some(total),
            (None, Some(declared)) => {
                if declared < session.offset {
                    return Err(ValidationError::LengthBelowOffset {
                        length: declared,
                        offset: session.offset,
                    }
                    .into());
                }
                if let Some(max) = self.inner.config.max_size {
                    if declared > max {
                        return Err(ValidationError::LengthExceedsMax {
                            length: declared,
                            max,
                        }
                        .into());
                    }
                }
                Some(declared)
            }
            (None, None) => None,
        };

        match (total, self.inner.config.max_size) {
            (Some(total), _) if end > total => Err(ValidationError::ChunkExceedsLength {
                offset: chunk.offset,
                len,
                total,
            }
            .into()),
            (None, Some(max)) if end > max => {
                Err(ValidationError::LengthExceedsMax { length: end, max }.into())
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Terminate
    // ========================================================================

    /// Cancel an upload: discard its parts and remove the record.
    ///
    /// Completed uploads cannot be terminated. A terminated record left by a
    /// failed completion is removed without touching storage.
    pub async fn terminate(&self, id: Uuid) -> Result<(), UploadError> {
        let lock = self.inner.guard.acquire(id).await;
        let result = self.terminate_locked(id).await;
        self.release(lock, id);
        result
    }

    async fn terminate_locked(&self, id: Uuid) -> Result<(), UploadError> {
        let session = self.store().get(id).await?;

        match session.state {
            UploadState::Completed => Err(UploadError::ConflictFinalized {
                id,
                state: session.state,
            }),
            UploadState::Terminated => {
                self.store().delete(id).await?;
                tracing::info!(upload_id = %id, "Removed terminated upload record");
                Ok(())
            }
            UploadState::Created | UploadState::InProgress => {
                self.discard_active(&session).await?;
                tracing::info!(mount = %self.inner.config.mount, upload_id = %id, offset = session.offset, "Upload terminated");
                Ok(())
            }
        }
    }

    /// Terminate an active session and drop its parts and record
    async fn discard_active(&self, session: &UploadSession) -> Result<(), UploadError> {
        self.adapter().discard(&session.storage_locator).await?;

        match self.store().mark_terminated(session.id).await {
            Ok(_) | Err(StoreError::Finalized { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.hooks().on_terminate(session).await;
        self.store().delete(session.id).await?;

        Ok(())
    }

    // ========================================================================
    // Expiry Sweep
    // ========================================================================

    /// Expire idle sessions and purge old terminal records as of `now`.
    ///
    /// Completed objects are never touched; only their records are purged
    /// once the retention window has passed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, UploadError> {
        let config = &self.inner.config;
        let idle_cutoff = now - config.session_ttl;
        let retention_cutoff = now - config.completed_retention;

        let candidates = self
            .store()
            .list_stale(idle_cutoff.max(retention_cutoff))
            .await?;

        let mut report = SweepReport::default();
        for candidate in candidates {
            let id = candidate.id;
            let lock = self.inner.guard.acquire(id).await;

            // Re-read under the lock; the session may have moved on
            let session = match self.store().get(id).await {
                Ok(session) => session,
                Err(StoreError::NotFound(_)) => {
                    self.release(lock, id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "Sweep could not load session");
                    self.release(lock, id);
                    continue;
                }
            };

            let outcome = match session.state {
                UploadState::Created | UploadState::InProgress
                    if session.updated_at < idle_cutoff =>
                {
                    self.discard_active(&session).await.map(|_| {
                        report.expired += 1;
                    })
                }
                UploadState::Terminated if session.updated_at < idle_cutoff => {
                    self.store().delete(id).await.map_err(UploadError::from).map(|_| {
                        report.purged += 1;
                    })
                }
                UploadState::Completed if session.updated_at < retention_cutoff => {
                    self.store().delete(id).await.map_err(UploadError::from).map(|_| {
                        report.purged += 1;
                    })
                }
                _ => Ok(()),
            };

            if let Err(e) = outcome {
                tracing::warn!(upload_id = %id, error = %e, "Sweep failed for session");
            }
            self.release(lock, id);
        }

        if report.expired > 0 || report.purged > 0 {
            tracing::info!(
                mount = %config.mount,
                expired = report.expired,
                purged = report.purged,
                "Swept upload sessions"
            );
        }

        Ok(report)
    }

    /// Start background expiry sweep
    pub fn start_sweep_task(self, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_expired(Utc::now()).await {
                    tracing::warn!(mount = %self.mount(), error = %e, "Expiry sweep failed");
                }
            }
        })
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Bring a session's offset in line with what storage actually holds.
    ///
    /// Advances a lagging offset, terminates a session whose storage lost
    /// bytes, and re-runs completion for a fully received session.
    pub async fn reconcile(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        let lock = self.inner.guard.acquire(id).await;
        let result = self.reconcile_locked(&lock, id).await;
        self.release(lock, id);
        result
    }

    async fn reconcile_locked(
        &self,
        lock: &UploadLock,
        id: Uuid,
    ) -> Result<UploadSession, UploadError> {
        let mut session = self.store().get(id).await?;
        if session.is_terminal() {
            return Ok(session);
        }

        if !session.is_fully_received() {
            let stored = self.adapter().read_length(&session.storage_locator).await?;

            if stored < session.offset {
                tracing::error!(
                    upload_id = %id,
                    offset = session.offset,
                    stored,
                    "Storage holds fewer bytes than recorded"
                );
                self.mark_failed(&session).await;
                return Err(UploadError::BackendPermanent(format!(
                    "storage holds {} bytes, session recorded {}",
                    stored, session.offset
                )));
            }

            let target = session.total_length.map_or(stored, |total| stored.min(total));
            if target > session.offset {
                tracing::warn!(
                    upload_id = %id,
                    offset = session.offset,
                    stored = target,
                    "Advancing offset to persisted length"
                );
                session = self
                    .store()
                    .compare_and_advance_offset(id, session.offset, target)
                    .await?;
            }
        }

        if session.is_fully_received() {
            return self.finalize_locked(lock, session).await;
        }

        Ok(session)
    }

    /// Reconcile every active session; run at startup with a durable store.
    ///
    /// Returns how many sessions were checked successfully.
    pub async fn reconcile_all(&self) -> Result<usize, UploadError> {
        let sessions = self.store().list_active().await?;
        let mut reconciled = 0;

        for session in sessions {
            self.hooks().on_restore(&session).await;
            match self.reconcile(session.id).await {
                Ok(_) => reconciled += 1,
                Err(e) => {
                    tracing::warn!(upload_id = %session.id, error = %e, "Reconciliation failed")
                }
            }
        }

        tracing::info!(mount = %self.mount(), sessions = reconciled, "Reconciled upload sessions");
        Ok(reconciled)
    }

    // ========================================================================
    // Failure Handling
    // ========================================================================

    /// Translate a storage failure, terminating the session if it is permanent
    async fn storage_failure(
        &self,
        session: &UploadSession,
        err: AdapterError,
        context: &str,
    ) -> UploadError {
        match &err {
            AdapterError::Transient(reason) => {
                tracing::warn!(upload_id = %session.id, offset = session.offset, error = %reason, "{}", context);
            }
            AdapterError::Permanent(reason) => {
                tracing::error!(upload_id = %session.id, offset = session.offset, error = %reason, "{}", context);
                self.mark_failed(session).await;
            }
        }
        err.into()
    }

    /// Mark a session terminated after a failure, keeping its storage
    async fn mark_failed(&self, session: &UploadSession) {
        if let Err(e) = self.store().mark_terminated(session.id).await {
            tracing::warn!(upload_id = %session.id, error = %e, "Failed to mark session terminated");
        }
        self.hooks().on_terminate(session).await;
    }

    fn release(&self, lock: UploadLock, id: Uuid) {
        drop(lock);
        self.inner.guard.forget(id);
    }
}

fn verify_checksum(checksum: &ChunkChecksum, data: &[u8]) -> Result<(), ValidationError> {
    match checksum {
        ChunkChecksum::Sha256(expected) => {
            if super::compute_sha256(data) != *expected {
                return Err(ValidationError::ChecksumMismatch);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
