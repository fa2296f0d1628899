//! Upload types for the resumable upload protocol

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version spoken by every mount
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised in `Tus-Extension`
pub const TUS_EXTENSIONS: &str =
    "creation,creation-with-upload,creation-defer-length,termination,expiration,checksum";

/// Checksum algorithms accepted in `Upload-Checksum`
pub const CHECKSUM_ALGORITHMS: &str = "sha256";

/// Content type of PATCH bodies
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

// ============================================================================
// Session Types
// ============================================================================

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Session exists, no bytes persisted yet
    Created,
    /// Some bytes persisted, or length still deferred
    InProgress,
    /// Final object composed
    Completed,
    /// Cancelled, expired, or failed
    Terminated,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle issued by a storage adapter for one upload.
///
/// Adapters derive both the staging area for parts and the final object
/// key from it; nothing outside the adapter should interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageLocator(String);

impl StorageLocator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an upload should be allocated, as resolved by the create hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorHint {
    pub id: Uuid,
    /// Tenant namespace, e.g. `media-files/<propertyId>`; `None` = bucket root
    pub namespace: Option<String>,
}

/// Reference to a composed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalObject {
    pub key: String,
    pub size: u64,
}

/// Upload session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Declared final size; `None` while the length is deferred
    pub total_length: Option<u64>,

    /// Bytes durably persisted so far
    pub offset: u64,

    /// Client metadata (immutable after creation except via the finish hook)
    pub metadata: Metadata,

    /// Adapter handle for parts and the final object
    pub storage_locator: StorageLocator,

    /// Current lifecycle state
    pub state: UploadState,

    /// Key of the composed object once completed
    pub final_object: Option<String>,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Last successful mutation
    pub updated_at: DateTime<Utc>,

    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Create a new upload session in the `Created` state
    pub fn new(
        id: Uuid,
        total_length: Option<u64>,
        metadata: Metadata,
        storage_locator: StorageLocator,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            total_length,
            offset: 0,
            metadata,
            storage_locator,
            state: UploadState::Created,
            final_object: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_length_deferred(&self) -> bool {
        self.total_length.is_none()
    }

    /// Every declared byte has been persisted
    pub fn is_fully_received(&self) -> bool {
        self.total_length == Some(self.offset)
    }

    /// When an idle session becomes eligible for the expiry sweep
    pub fn expires_at(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            None
        } else {
            Some(self.updated_at + ttl)
        }
    }
}

/// Declared length of a new upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLength {
    Fixed(u64),
    Deferred,
}

impl UploadLength {
    pub fn fixed(&self) -> Option<u64> {
        match self {
            Self::Fixed(length) => Some(*length),
            Self::Deferred => None,
        }
    }
}

// ============================================================================
// Operation Types
// ============================================================================

/// Input to [`ProtocolEngine::create`](super::ProtocolEngine::create)
#[derive(Debug, Clone)]
pub struct CreateUpload {
    pub length: UploadLength,
    pub metadata: Metadata,
}

/// Checksum supplied with a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkChecksum {
    Sha256(Vec<u8>),
}

/// Input to [`ProtocolEngine::append`](super::ProtocolEngine::append)
#[derive(Debug, Clone)]
pub struct AppendChunk {
    pub id: Uuid,
    /// Offset the client believes is current
    pub offset: u64,
    pub data: bytes::Bytes,
    /// Length declared alongside the chunk (deferred-length sessions)
    pub declared_length: Option<u64>,
    pub checksum: Option<ChunkChecksum>,
}

/// Result of a successful append
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub session: UploadSession,
    /// This append performed the completion transition
    pub completed: bool,
}

/// Counts reported by one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle sessions terminated and discarded
    pub expired: usize,
    /// Terminal records removed
    pub purged: usize,
}

// ============================================================================
// Error Types
// ============================================================================

/// Reasons a request is refused before it changes anything
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing routing key: metadata must include {0}")]
    MissingRoutingKey(String),

    #[error("invalid routing key {0:?}")]
    InvalidRoutingKey(String),

    #[error("missing required metadata key {0}")]
    MissingMetadata(String),

    #[error("metadata key {0} is not accepted by this endpoint")]
    UnknownMetadata(String),

    #[error("invalid Upload-Metadata: {0}")]
    MalformedMetadata(String),

    #[error("Folder {0} already exists with files. Upload not allowed.")]
    NamespaceNotEmpty(String),

    #[error("Folder {0} is reserved by another upload in progress. Upload not allowed.")]
    NamespaceReserved(String),

    #[error("upload length {length} exceeds maximum size {max}")]
    LengthExceedsMax { length: u64, max: u64 },

    #[error("chunk of {len} bytes at offset {offset} exceeds upload length {total}")]
    ChunkExceedsLength { offset: u64, len: u64, total: u64 },

    #[error("upload length is already fixed at {0}")]
    LengthAlreadyFixed(u64),

    #[error("declared length {length} is smaller than the bytes already received ({offset})")]
    LengthBelowOffset { length: u64, offset: u64 },

    #[error("chunk checksum does not match its content")]
    ChecksumMismatch,

    #[error("upload rejected: {0}")]
    Rejected(String),
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("offset mismatch: request offset {provided} does not match current offset {expected}")]
    OffsetMismatch { expected: u64, provided: u64 },

    #[error("upload {id} is {state} and accepts no further changes")]
    ConflictFinalized { id: Uuid, state: UploadState },

    #[error("backend unavailable: {0}")]
    BackendTransient(String),

    #[error("backend failure: {0}")]
    BackendPermanent(String),

    #[error("upload not found: {0}")]
    NotFound(String),
}

impl UploadError {
    /// Whether the client may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendTransient(_))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: Option<u64>) -> UploadSession {
        UploadSession::new(
            Uuid::new_v4(),
            total,
            Metadata::default(),
            StorageLocator::new("test"),
        )
    }

    #[test]
    fn test_state_round_trip_names() {
        for state in [
            UploadState::Created,
            UploadState::InProgress,
            UploadState::Completed,
            UploadState::Terminated,
        ] {
            assert_eq!(UploadState::parse(state.as_str()), Some(state));
        }
        assert_eq!(UploadState::parse("pending"), None);
    }

    #[test]
    fn test_expiry_only_for_active_sessions() {
        let mut s = session(Some(10));
        let ttl = Duration::hours(1);
        assert_eq!(s.expires_at(ttl), Some(s.updated_at + ttl));

        s.state = UploadState::Completed;
        assert_eq!(s.expires_at(ttl), None);
    }

    #[test]
    fn test_fully_received() {
        let mut s = session(Some(10));
        s.offset = 5;
        assert!(!s.is_fully_received());
        s.offset = 10;
        assert!(s.is_fully_received());
        assert!(session(Some(0)).is_fully_received());
        assert!(!session(None).is_fully_received());
    }
}
