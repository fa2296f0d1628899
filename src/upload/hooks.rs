//! Validation & routing hooks
//!
//! Hooks run during creation and completion. A create hook resolves where
//! the upload lands and may refuse it before anything is allocated; a finish
//! hook may rewrite metadata as part of the completion write.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::adapter::StorageAdapter;
use super::metadata::Metadata;
use super::types::{UploadError, UploadSession, ValidationError};

/// Reasons a hook refuses an upload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookRejection {
    #[error("missing routing key: metadata must include {0}")]
    MissingRoutingKey(String),

    #[error("invalid routing key {0:?}: must be a single path segment")]
    InvalidRoutingKey(String),

    #[error("Folder {0} already exists with files. Upload not allowed.")]
    NamespaceNotEmpty(String),

    #[error("Folder {0} is reserved by another upload in progress. Upload not allowed.")]
    NamespaceReserved(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    Rejected(String),
}

impl From<HookRejection> for UploadError {
    fn from(rejection: HookRejection) -> Self {
        match rejection {
            HookRejection::MissingRoutingKey(key) => ValidationError::MissingRoutingKey(key).into(),
            HookRejection::InvalidRoutingKey(value) => {
                ValidationError::InvalidRoutingKey(value).into()
            }
            HookRejection::NamespaceNotEmpty(ns) => ValidationError::NamespaceNotEmpty(ns).into(),
            HookRejection::NamespaceReserved(ns) => ValidationError::NamespaceReserved(ns).into(),
            HookRejection::BackendUnavailable(reason) => UploadError::BackendTransient(reason),
            HookRejection::Rejected(reason) => ValidationError::Rejected(reason).into(),
        }
    }
}

/// What a create hook decided for an accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDecision {
    /// Storage namespace, `None` for the bucket root
    pub namespace: Option<String>,
    /// Metadata to store with the session
    pub metadata: Metadata,
}

/// Hooks invoked by the protocol engine
#[async_trait::async_trait]
pub trait UploadHooks: Send + Sync {
    /// Accept or refuse a new upload. Runs before any allocation.
    async fn on_create(&self, id: Uuid, metadata: &Metadata)
        -> Result<CreateDecision, HookRejection>;

    /// Runs after composition, before the session is marked completed.
    /// The returned metadata replaces the session's metadata.
    async fn on_finish(
        &self,
        session: &UploadSession,
        final_size: u64,
    ) -> Result<Metadata, HookRejection>;

    /// An accepted creation failed later (allocation or store write)
    async fn on_create_aborted(&self, _decision: &CreateDecision) {}

    /// The session was terminated or its completion failed
    async fn on_terminate(&self, _session: &UploadSession) {}

    /// An active session was found in the store at startup
    async fn on_restore(&self, _session: &UploadSession) {}
}

// ============================================================================
// Passthrough Hooks
// ============================================================================

/// Accepts everything; objects land at the bucket root
#[derive(Debug, Default, Clone)]
pub struct PassthroughHooks;

#[async_trait::async_trait]
impl UploadHooks for PassthroughHooks {
    async fn on_create(
        &self,
        id: Uuid,
        metadata: &Metadata,
    ) -> Result<CreateDecision, HookRejection> {
        tracing::info!(upload_id = %id, metadata = %metadata.to_header(), "Upload create requested");

        Ok(CreateDecision {
            namespace: None,
            metadata: metadata.clone(),
        })
    }

    async fn on_finish(
        &self,
        session: &UploadSession,
        final_size: u64,
    ) -> Result<Metadata, HookRejection> {
        tracing::info!(upload_id = %session.id, size = final_size, "Upload finished");
        Ok(session.metadata.clone())
    }
}

// ============================================================================
// Routed Namespace Hooks
// ============================================================================

/// Routes each upload under `<namespace_root>/<routing key value>` and
/// refuses namespaces that already hold objects.
///
/// The emptiness check and the allocation are made exclusive within this
/// process by reserving the namespace before listing it. Two processes
/// sharing a bucket can still race.
pub struct RoutedNamespaceHooks {
    adapter: Arc<dyn StorageAdapter>,
    routing_key: String,
    namespace_root: String,
    reservations: Mutex<HashSet<String>>,
}

impl RoutedNamespaceHooks {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        routing_key: impl Into<String>,
        namespace_root: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            routing_key: routing_key.into(),
            namespace_root: namespace_root.into().trim_end_matches('/').to_string(),
            reservations: Mutex::new(HashSet::new()),
        }
    }

    /// Namespace for a routing key value, if the value is usable
    pub fn namespace_for(&self, value: &str) -> Result<String, HookRejection> {
        let valid = !value.is_empty()
            && value != "."
            && value != ".."
            && !value.contains(['/', '\\'])
            && !value.chars().any(char::is_control);
        if !valid {
            return Err(HookRejection::InvalidRoutingKey(value.to_string()));
        }
        Ok(format!("{}/{}", self.namespace_root, value))
    }

    fn session_namespace(&self, session: &UploadSession) -> Option<String> {
        let value = session.metadata.get(&self.routing_key)?;
        self.namespace_for(value).ok()
    }

    fn release(&self, namespace: &str) {
        self.reservations.lock().remove(namespace);
    }

    pub fn is_reserved(&self, namespace: &str) -> bool {
        self.reservations.lock().contains(namespace)
    }
}

#[async_trait::async_trait]
impl UploadHooks for RoutedNamespaceHooks {
    async fn on_create(
        &self,
        id: Uuid,
        metadata: &Metadata,
    ) -> Result<CreateDecision, HookRejection> {
        let value = metadata
            .get(&self.routing_key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| HookRejection::MissingRoutingKey(self.routing_key.clone()))?;
        let namespace = self.namespace_for(value)?;

        if !self.reservations.lock().insert(namespace.clone()) {
            tracing::warn!(upload_id = %id, namespace = %namespace, "Namespace reserved by another upload");
            return Err(HookRejection::NamespaceReserved(namespace));
        }

        match self.adapter.namespace_is_empty(&namespace).await {
            Ok(true) => {
                tracing::info!(upload_id = %id, namespace = %namespace, "Namespace reserved for upload");
                Ok(CreateDecision {
                    namespace: Some(namespace),
                    metadata: metadata.clone(),
                })
            }
            Ok(false) => {
                self.release(&namespace);
                tracing::warn!(upload_id = %id, namespace = %namespace, "Namespace already has files");
                Err(HookRejection::NamespaceNotEmpty(namespace))
            }
            Err(e) => {
                self.release(&namespace);
                tracing::warn!(upload_id = %id, namespace = %namespace, error = %e, "Namespace check failed");
                Err(HookRejection::BackendUnavailable(format!(
                    "could not check folder {}: {}",
                    namespace, e
                )))
            }
        }
    }

    async fn on_finish(
        &self,
        session: &UploadSession,
        final_size: u64,
    ) -> Result<Metadata, HookRejection> {
        if let Some(namespace) = self.session_namespace(session) {
            self.release(&namespace);
        }
        tracing::info!(upload_id = %session.id, size = final_size, "Routed upload finished");
        Ok(session.metadata.clone())
    }

    async fn on_create_aborted(&self, decision: &CreateDecision) {
        if let Some(namespace) = &decision.namespace {
            self.release(namespace);
        }
    }

    async fn on_terminate(&self, session: &UploadSession) {
        if let Some(namespace) = self.session_namespace(session) {
            self.release(&namespace);
        }
    }

    async fn on_restore(&self, session: &UploadSession) {
        if let Some(namespace) = self.session_namespace(session) {
            self.reservations.lock().insert(namespace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::adapter::LocalStorageAdapter;
    use crate::upload::types::{LocatorHint, StorageLocator};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn metadata(property: &str) -> Metadata {
        [("propertyId", property)].into_iter().collect()
    }

    fn hooks(temp_dir: &TempDir) -> (Arc<LocalStorageAdapter>, RoutedNamespaceHooks) {
        let adapter = Arc::new(LocalStorageAdapter::new(temp_dir.path()));
        let hooks = RoutedNamespaceHooks::new(adapter.clone(), "propertyId", "media-files");
        (adapter, hooks)
    }

    #[tokio::test]
    async fn test_missing_routing_key() {
        let temp_dir = TempDir::new().unwrap();
        let (_, hooks) = hooks(&temp_dir);

        let result = hooks.on_create(Uuid::new_v4(), &Metadata::new()).await;
        assert_eq!(
            result,
            Err(HookRejection::MissingRoutingKey("propertyId".to_string()))
        );
    }

    #[tokio::test]
    async fn test_routing_key_must_be_one_segment() {
        let temp_dir = TempDir::new().unwrap();
        let (_, hooks) = hooks(&temp_dir);

        for bad in ["..", "a/b", "a\\b"] {
            let result = hooks.on_create(Uuid::new_v4(), &metadata(bad)).await;
            assert!(matches!(result, Err(HookRejection::InvalidRoutingKey(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_resolves_namespace_and_reserves_it() {
        let temp_dir = TempDir::new().unwrap();
        let (_, hooks) = hooks(&temp_dir);

        let decision = hooks.on_create(Uuid::new_v4(), &metadata("p1")).await.unwrap();
        assert_eq!(decision.namespace.as_deref(), Some("media-files/p1"));
        assert!(hooks.is_reserved("media-files/p1"));

        let second = hooks.on_create(Uuid::new_v4(), &metadata("p1")).await;
        assert_eq!(
            second,
            Err(HookRejection::NamespaceReserved("media-files/p1".to_string()))
        );

        hooks.on_create_aborted(&decision).await;
        assert!(!hooks.is_reserved("media-files/p1"));
        assert!(hooks.on_create(Uuid::new_v4(), &metadata("p1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_refuses_namespace_with_files() {
        let temp_dir = TempDir::new().unwrap();
        let (adapter, hooks) = hooks(&temp_dir);

        let locator = adapter
            .allocate(&LocatorHint {
                id: Uuid::new_v4(),
                namespace: Some("media-files/p1".to_string()),
            })
            .await
            .unwrap();
        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        adapter.compose(&locator, 1).await.unwrap();

        let rejection = hooks
            .on_create(Uuid::new_v4(), &metadata("p1"))
            .await
            .unwrap_err();
        assert_eq!(
            rejection.to_string(),
            "Folder media-files/p1 already exists with files. Upload not allowed."
        );
        assert!(!hooks.is_reserved("media-files/p1"));

        assert!(hooks.on_create(Uuid::new_v4(), &metadata("p2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_finish_and_terminate_release_reservation() {
        let temp_dir = TempDir::new().unwrap();
        let (_, hooks) = hooks(&temp_dir);

        hooks.on_create(Uuid::new_v4(), &metadata("p1")).await.unwrap();
        let session = UploadSession::new(
            Uuid::new_v4(),
            Some(1),
            metadata("p1"),
            StorageLocator::new("media-files/p1/x"),
        );

        hooks.on_terminate(&session).await;
        assert!(!hooks.is_reserved("media-files/p1"));

        hooks.on_restore(&session).await;
        assert!(hooks.is_reserved("media-files/p1"));

        let finished = hooks.on_finish(&session, 1).await.unwrap();
        assert_eq!(finished, session.metadata);
        assert!(!hooks.is_reserved("media-files/p1"));
    }

    #[test]
    fn test_rejections_map_to_distinct_errors() {
        assert!(matches!(
            UploadError::from(HookRejection::MissingRoutingKey("propertyId".into())),
            UploadError::Validation(ValidationError::MissingRoutingKey(_))
        ));
        assert!(matches!(
            UploadError::from(HookRejection::NamespaceNotEmpty("media-files/p1".into())),
            UploadError::Validation(ValidationError::NamespaceNotEmpty(_))
        ));
        assert!(matches!(
            UploadError::from(HookRejection::BackendUnavailable("down".into())),
            UploadError::BackendTransient(_)
        ));
    }
}
