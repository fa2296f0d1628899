//! Resumable Upload Module (tus 1.0.0)
//!
//! Implements resumable uploads over object storage with:
//! - Offset-verified chunk appends with atomic compare-and-advance
//! - Per-upload serialization of mutating operations
//! - Parts staged per chunk and composed once at completion
//! - Creation hooks that route uploads into tenant namespaces
//!
//! Protocol Flow:
//! 1. Client creates an upload with its length (or defers it) and metadata
//! 2. Client appends chunks at the offset the server reports
//! 3. After an interruption the client queries the offset and resumes
//! 4. When the last byte arrives the parts are composed into the final object

pub mod adapter;
pub mod engine;
pub mod guard;
pub mod hooks;
pub mod metadata;
pub mod store;
pub mod types;

pub use adapter::{AdapterError, LocalStorageAdapter, S3StorageAdapter, StorageAdapter};
pub use engine::{EngineConfig, ProtocolEngine};
pub use guard::{ConcurrencyGuard, UploadLock};
pub use hooks::{CreateDecision, HookRejection, PassthroughHooks, RoutedNamespaceHooks, UploadHooks};
pub use metadata::{Metadata, MetadataSchema};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoreError};
pub use types::*;

use sha2::{Digest, Sha256};

/// SHA-256 digest of `data`
pub fn compute_sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn test_compute_sha256() {
        let digest = compute_sha256(b"hello");
        assert_eq!(digest.len(), 32);
        assert_eq!(
            STANDARD.encode(digest),
            "LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ="
        );
    }
}
