//! tus Routes
//!
//! HTTP endpoints for the tus 1.0.0 resumable upload protocol, one set per mount.
//!
//! Endpoints:
//! - OPTIONS <base> - Protocol discovery
//! - POST <base> - Create an upload (optionally with its first chunk)
//! - HEAD <base>/:id - Current offset and length
//! - PATCH <base>/:id - Append a chunk at the current offset
//! - DELETE <base>/:id - Terminate an upload

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{head, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::state::Mount;
use crate::upload::{
    compute_sha256, AppendChunk, ChunkChecksum, CreateUpload, Metadata, UploadError, UploadLength,
    UploadSession, UploadState, ValidationError, CHECKSUM_ALGORITHMS, OFFSET_OCTET_STREAM,
    TUS_EXTENSIONS, TUS_VERSION,
};

// ============================================================================
// Headers
// ============================================================================

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("tus-checksum-algorithm");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_CONCAT: HeaderName = HeaderName::from_static("upload-concat");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");

/// Status for a chunk whose checksum does not match (tus checksum extension)
const CHECKSUM_MISMATCH: u16 = 460;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Errors surfaced by the tus endpoints
#[derive(Debug, thiserror::Error)]
pub enum TusError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("unsupported protocol version, expected Tus-Resumable: {}", TUS_VERSION)]
    UnsupportedVersion,

    #[error("{0}")]
    BadRequest(String),

    #[error("Content-Type must be {}", OFFSET_OCTET_STREAM)]
    UnsupportedMediaType,
}

impl From<ValidationError> for TusError {
    fn from(err: ValidationError) -> Self {
        TusError::Upload(err.into())
    }
}

impl TusError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            TusError::UnsupportedVersion => (StatusCode::PRECONDITION_FAILED, "UNSUPPORTED_VERSION"),
            TusError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            TusError::UnsupportedMediaType => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            TusError::Upload(err) => status_for(err),
        }
    }

    /// Status and protocol headers only, for `HEAD` responses
    fn without_body(self) -> Response {
        let (status, _) = self.status_and_code();
        let mut response = status.into_response();
        self.add_headers(response.headers_mut());
        response
    }

    fn add_headers(&self, headers: &mut HeaderMap) {
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        if matches!(self, TusError::UnsupportedVersion) {
            headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
        }
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
}

fn status_for(err: &UploadError) -> (StatusCode, &'static str) {
    match err {
        UploadError::Validation(v) => match v {
            ValidationError::NamespaceNotEmpty(_) => (StatusCode::CONFLICT, "NAMESPACE_NOT_EMPTY"),
            ValidationError::NamespaceReserved(_) => (StatusCode::CONFLICT, "NAMESPACE_RESERVED"),
            ValidationError::LengthExceedsMax { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "UPLOAD_TOO_LARGE")
            }
            ValidationError::ChunkExceedsLength { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "CHUNK_EXCEEDS_LENGTH")
            }
            ValidationError::ChecksumMismatch => (
                StatusCode::from_u16(CHECKSUM_MISMATCH).unwrap_or(StatusCode::BAD_REQUEST),
                "CHECKSUM_MISMATCH",
            ),
            ValidationError::MissingRoutingKey(_) => (StatusCode::BAD_REQUEST, "MISSING_ROUTING_KEY"),
            ValidationError::InvalidRoutingKey(_) => (StatusCode::BAD_REQUEST, "INVALID_ROUTING_KEY"),
            ValidationError::MissingMetadata(_)
            | ValidationError::UnknownMetadata(_)
            | ValidationError::MalformedMetadata(_) => (StatusCode::BAD_REQUEST, "INVALID_METADATA"),
            ValidationError::LengthAlreadyFixed(_) | ValidationError::LengthBelowOffset { .. } => {
                (StatusCode::BAD_REQUEST, "INVALID_LENGTH")
            }
            ValidationError::Rejected(_) => (StatusCode::BAD_REQUEST, "UPLOAD_REJECTED"),
        },
        UploadError::OffsetMismatch { .. } => (StatusCode::CONFLICT, "OFFSET_MISMATCH"),
        UploadError::ConflictFinalized {
            state: UploadState::Terminated,
            ..
        } => (StatusCode::GONE, "UPLOAD_TERMINATED"),
        UploadError::ConflictFinalized { .. } => (StatusCode::CONFLICT, "UPLOAD_FINALIZED"),
        UploadError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        UploadError::BackendTransient(_) => (StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE"),
        UploadError::BackendPermanent(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BACKEND_FAILURE"),
    }
}

impl IntoResponse for TusError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Upload request rejected");
        }

        let body = Json(ErrorResponse {
            error: code,
            message: self.to_string(),
        });

        let mut response = (status, body).into_response();
        self.add_headers(response.headers_mut());
        response
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the tus router for one mount
pub fn router(mount: Mount, max_body_bytes: usize) -> Router {
    let base = mount.path.trim_end_matches('/').to_string();
    let resource = format!("{}/:id", base);

    Router::new()
        .route(&base, post(create_upload).options(options))
        .route(
            &resource,
            head(upload_status_handler)
                .patch(append_chunk)
                .delete(terminate_upload)
                .options(options),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(mount)
}

// ============================================================================
// Handlers
// ============================================================================

/// OPTIONS <base>
///
/// Advertise protocol version, extensions and limits. CORS preflights are
/// answered by the CORS layer before reaching this handler.
async fn options(State(mount): State<Mount>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(
        TUS_CHECKSUM_ALGORITHM,
        HeaderValue::from_static(CHECKSUM_ALGORITHMS),
    );
    if let Some(max) = mount.engine.max_size() {
        headers.insert(TUS_MAX_SIZE, HeaderValue::from(max));
    }

    (StatusCode::NO_CONTENT, headers).into_response()
}

/// POST <base>
///
/// Create an upload. A body sent as `application/offset+octet-stream` is
/// appended at offset 0 (creation-with-upload).
async fn create_upload(
    State(mount): State<Mount>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TusError> {
    require_tus_resumable(&headers)?;

    if headers.contains_key(UPLOAD_CONCAT) {
        return Err(TusError::BadRequest(
            "Upload-Concat is not supported".to_string(),
        ));
    }

    let length = parse_upload_length(&headers)?;
    let metadata = match header_str(&headers, &UPLOAD_METADATA)? {
        Some(value) => Metadata::parse_header(value)?,
        None => Metadata::new(),
    };

    // Reject a bad first chunk before anything is created
    let first_chunk = if !body.is_empty() && is_offset_octet_stream(&headers) {
        let checksum = parse_checksum(&headers)?;
        check_first_chunk(&mount, length, &body, checksum.as_ref())?;
        Some((body, checksum))
    } else {
        None
    };

    let mut session = mount.engine.create(CreateUpload { length, metadata }).await?;

    if let Some((data, checksum)) = first_chunk {
        let appended = mount
            .engine
            .append(AppendChunk {
                id: session.id,
                offset: 0,
                data,
                declared_length: None,
                checksum,
            })
            .await;

        match appended {
            Ok(outcome) => session = outcome.session,
            // The upload exists; the client resumes from the reported offset
            Err(e) if e.is_retryable() => {
                tracing::warn!(upload_id = %session.id, error = %e, "First chunk not completed, client must resume");
                if let Ok(current) = mount.engine.query(session.id).await {
                    session = current;
                }
            }
            Err(e) => {
                if let Err(cleanup) = mount.engine.terminate(session.id).await {
                    tracing::warn!(upload_id = %session.id, error = %cleanup, "Failed to remove upload after rejected first chunk");
                }
                return Err(e.into());
            }
        }
    }

    let location = location(&mount, &headers, session.id);
    let mut response_headers = progress_headers(&mount, &session);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response_headers.insert(header::LOCATION, value);
    }

    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// HEAD <base>/:id
///
/// Report the current offset so a client can resume.
async fn upload_status_handler(
    State(mount): State<Mount>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    upload_status(&mount, &id, &headers)
        .await
        .unwrap_or_else(TusError::without_body)
}

async fn upload_status(mount: &Mount, id: &str, headers: &HeaderMap) -> Result<Response, TusError> {
    require_tus_resumable(headers)?;
    let id = parse_id(id)?;
    let session = mount.engine.query(id).await?;

    if session.state == UploadState::Terminated {
        return Err(UploadError::ConflictFinalized {
            id,
            state: session.state,
        }
        .into());
    }

    let mut response_headers = progress_headers(mount, &session);
    match session.total_length {
        Some(total) => {
            response_headers.insert(UPLOAD_LENGTH, HeaderValue::from(total));
        }
        None => {
            response_headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }
    if !session.metadata.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&session.metadata.to_header()) {
            response_headers.insert(UPLOAD_METADATA, value);
        }
    }

    Ok((StatusCode::OK, response_headers).into_response())
}

/// PATCH <base>/:id
///
/// Append a chunk at `Upload-Offset`.
async fn append_chunk(
    State(mount): State<Mount>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TusError> {
    require_tus_resumable(&headers)?;
    if !is_offset_octet_stream(&headers) {
        return Err(TusError::UnsupportedMediaType);
    }

    let offset = header_number(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| TusError::BadRequest("missing Upload-Offset".to_string()))?;
    let declared_length = header_number(&headers, &UPLOAD_LENGTH)?;
    let checksum = parse_checksum(&headers)?;
    let id = parse_id(&id)?;

    let outcome = mount
        .engine
        .append(AppendChunk {
            id,
            offset,
            data: body,
            declared_length,
            checksum,
        })
        .await?;

    Ok((StatusCode::NO_CONTENT, progress_headers(&mount, &outcome.session)).into_response())
}

/// DELETE <base>/:id
///
/// Terminate an upload and discard its parts.
async fn terminate_upload(
    State(mount): State<Mount>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, TusError> {
    require_tus_resumable(&headers)?;
    let id = parse_id(&id)?;

    mount.engine.terminate(id).await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn require_tus_resumable(headers: &HeaderMap) -> Result<(), TusError> {
    match headers.get(&TUS_RESUMABLE).and_then(|v| v.to_str().ok()) {
        Some(TUS_VERSION) => Ok(()),
        _ => Err(TusError::UnsupportedVersion),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>, TusError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| TusError::BadRequest(format!("{} is not valid text", name)))
        })
        .transpose()
}

fn header_number(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, TusError> {
    header_str(headers, name)?
        .map(|value| {
            value.parse::<u64>().map_err(|_| {
                TusError::BadRequest(format!("{} must be a non-negative integer", name))
            })
        })
        .transpose()
}

fn parse_upload_length(headers: &HeaderMap) -> Result<UploadLength, TusError> {
    let length = header_number(headers, &UPLOAD_LENGTH)?;
    let deferred = header_str(headers, &UPLOAD_DEFER_LENGTH)?;

    match (length, deferred) {
        (Some(_), Some(_)) => Err(TusError::BadRequest(
            "Upload-Length and Upload-Defer-Length are mutually exclusive".to_string(),
        )),
        (Some(length), None) => Ok(UploadLength::Fixed(length)),
        (None, Some("1")) => Ok(UploadLength::Deferred),
        (None, Some(_)) => Err(TusError::BadRequest(
            "Upload-Defer-Length must be 1".to_string(),
        )),
        (None, None) => Err(TusError::BadRequest(
            "Upload-Length or Upload-Defer-Length is required".to_string(),
        )),
    }
}

/// Parse `Upload-Checksum: sha256 <base64 digest>`
fn parse_checksum(headers: &HeaderMap) -> Result<Option<ChunkChecksum>, TusError> {
    let Some(value) = header_str(headers, &UPLOAD_CHECKSUM)? else {
        return Ok(None);
    };

    let (algorithm, digest) = value
        .split_once(' ')
        .ok_or_else(|| TusError::BadRequest("Upload-Checksum must be '<algorithm> <digest>'".to_string()))?;

    if !algorithm.eq_ignore_ascii_case("sha256") {
        return Err(TusError::BadRequest(format!(
            "unsupported checksum algorithm {}",
            algorithm
        )));
    }

    let digest = STANDARD
        .decode(digest.trim())
        .map_err(|_| TusError::BadRequest("Upload-Checksum digest is not base64".to_string()))?;

    Ok(Some(ChunkChecksum::Sha256(digest)))
}

/// Checks on a creation-with-upload body that need no session
fn check_first_chunk(
    mount: &Mount,
    length: UploadLength,
    data: &[u8],
    checksum: Option<&ChunkChecksum>,
) -> Result<(), TusError> {
    let len = data.len() as u64;

    match (length, mount.engine.max_size()) {
        (UploadLength::Fixed(total), _) if len > total => {
            return Err(ValidationError::ChunkExceedsLength {
                offset: 0,
                len,
                total,
            }
            .into());
        }
        (UploadLength::Deferred, Some(max)) if len > max => {
            return Err(ValidationError::LengthExceedsMax { length: len, max }.into());
        }
        _ => {}
    }

    match checksum {
        Some(ChunkChecksum::Sha256(expected)) if compute_sha256(data) != *expected => {
            Err(ValidationError::ChecksumMismatch.into())
        }
        _ => Ok(()),
    }
}

fn is_offset_octet_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim())
        .map_or(false, |v| v.eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

fn parse_id(id: &str) -> Result<Uuid, TusError> {
    Uuid::parse_str(id).map_err(|_| UploadError::NotFound(id.to_string()).into())
}

/// Absolute URL of an upload resource
fn location(mount: &Mount, headers: &HeaderMap, id: Uuid) -> String {
    let path = format!("{}/{}", mount.path.trim_end_matches('/'), id);

    if let Some(base) = &mount.public_url {
        return format!("{}{}", base, path);
    }

    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");

    match host {
        Some(host) => format!("{}://{}{}", proto, host, path),
        None => path,
    }
}

/// `Upload-Offset`, `Upload-Expires` and `Tus-Resumable`
fn progress_headers(mount: &Mount, session: &UploadSession) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(session.offset));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(expires) = mount.engine.expires_at(session) {
        if let Ok(value) = HeaderValue::from_str(&http_date(expires)) {
            headers.insert(UPLOAD_EXPIRES, value);
        }
    }
    headers
}

/// RFC 7231 HTTP-date
fn http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ============================================================================
// Tests
// ============================================================================
