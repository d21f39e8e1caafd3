//! Remote object store client with resumable chunked uploads.
//!
//! Mirrors harvested files into a Drive-style object store: folders are
//! looked up or created by name, uploads go through a resumable session in
//! fixed-size chunks, and an upload whose destination name already exists
//! under the target folder short-circuits to the existing object id, making
//! the whole pass idempotent.
//!
//! Authentication is delegated to a [`TokenProvider`]; token refresh and the
//! interactive OAuth flow live outside this crate. The shipped
//! [`StoredToken`] loads an already-obtained token from disk and fails fast
//! with a distinguishable [`StoreError::Credential`] when none is usable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::transfer::{FailureType, RetryExecutor, RetryPolicy};

/// Upload chunk size (8 MiB, a multiple of the protocol's 256 KiB granule).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Maximum retries for a single chunk before the upload aborts.
pub const CHUNK_RETRY_LIMIT: u32 = 5;

/// Server statuses that make a chunk call worth retrying.
const RETRYABLE_CHUNK_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Base delay for chunk retry backoff (2s, 4s, 8s, ...).
const CHUNK_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Errors from remote store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No usable credential could be obtained. Setup-fatal for mirror runs.
    #[error("no usable credential: {reason}")]
    Credential {
        /// Why the credential is unusable.
        reason: String,
    },

    /// Network-level failure talking to the store.
    #[error("network error calling {endpoint}: {source}")]
    Network {
        /// The operation that failed (e.g. `files.list`).
        endpoint: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The store returned an error status.
    #[error("remote store returned HTTP {status} for {endpoint}")]
    Http {
        /// The operation that failed.
        endpoint: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The resumable session misbehaved (missing session URI, premature end).
    #[error("upload session failed for {name}: {reason}")]
    Session {
        /// Object name being uploaded.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Local file could not be read.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// The local path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn network(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    fn http(endpoint: impl Into<String>, status: u16) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            status,
        }
    }

    fn session(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Session {
            name: name.into(),
            reason: reason.into(),
        }
    }

    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Supplies a valid bearer token for store calls.
///
/// Implementations own refresh and must fail fast with
/// [`StoreError::Credential`] when no valid credential can be produced.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a bearer token valid for the next request.
    async fn access_token(&self) -> Result<String, StoreError>;
}

/// Shape of the stored credential file.
#[derive(Debug, Deserialize)]
struct StoredTokenRecord {
    access_token: String,
}

/// Token provider backed by a stored credential file.
///
/// The file is the JSON record written by an external authorization flow;
/// this provider only reads it.
#[derive(Debug, Clone)]
pub struct StoredToken {
    token: String,
}

impl StoredToken {
    /// Loads the credential file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Credential`] when the file is missing,
    /// unreadable, malformed, or holds an empty token.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| StoreError::Credential {
            reason: format!("credential file {} not readable: {e}", path.display()),
        })?;
        let record: StoredTokenRecord =
            serde_json::from_str(&raw).map_err(|e| StoreError::Credential {
                reason: format!("credential file {} is malformed: {e}", path.display()),
            })?;
        if record.access_token.trim().is_empty() {
            return Err(StoreError::Credential {
                reason: format!("credential file {} holds an empty token", path.display()),
            });
        }
        Ok(Self {
            token: record.access_token,
        })
    }
}

#[async_trait]
impl TokenProvider for StoredToken {
    async fn access_token(&self) -> Result<String, StoreError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

/// One chunk call's outcome inside the resumable session.
#[derive(Debug)]
enum ChunkStatus {
    /// Server acknowledged the range; send the next chunk.
    Incomplete,
    /// Upload finished; the object id is final.
    Complete(String),
}

/// Client for the remote object store.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    token: Arc<dyn TokenProvider>,
    api_base: String,
    upload_base: String,
    chunk_size: usize,
    chunk_retry: RetryExecutor,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("api_base", &self.api_base)
            .field("upload_base", &self.upload_base)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Creates a store client against the production endpoints.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new(token: Arc<dyn TokenProvider>) -> Self {
        Self::with_endpoints(token, API_BASE, UPLOAD_BASE)
    }

    /// Creates a store client against explicit endpoints (used by tests).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_endpoints(
        token: Arc<dyn TokenProvider>,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client with static configuration");
        let chunk_policy = RetryPolicy::new(
            CHUNK_RETRY_LIMIT + 1,
            CHUNK_RETRY_BASE_DELAY,
            Duration::from_secs(64),
            2.0,
        );
        Self {
            client,
            token,
            api_base: api_base.into(),
            upload_base: upload_base.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_retry: RetryExecutor::new(chunk_policy),
        }
    }

    /// Overrides the upload chunk size (used by tests to keep fixtures small).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Looks up an object by name under `parent`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on credential, network, or HTTP failure.
    #[instrument(skip(self))]
    pub async fn find_object(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        self.find_with_query(name, parent, None).await
    }

    /// Looks up a folder by name, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on credential, network, or HTTP failure.
    #[instrument(skip(self))]
    pub async fn ensure_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError> {
        if let Some(id) = self.find_with_query(name, parent, Some(FOLDER_MIME)).await? {
            debug!(folder = name, id = %id, "folder already present");
            return Ok(id);
        }

        let token = self.token.access_token().await?;
        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }

        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| StoreError::network("files.create", e))?;

        if !response.status().is_success() {
            return Err(StoreError::http(
                "files.create",
                response.status().as_u16(),
            ));
        }

        let created: FileRef = response
            .json()
            .await
            .map_err(|e| StoreError::network("files.create", e))?;
        info!(folder = name, id = %created.id, "created remote folder");
        Ok(created.id)
    }

    /// Uploads a local file into `folder_id` through a resumable session.
    ///
    /// If an object with the same name already exists under the folder, its
    /// id is returned without re-uploading. Each chunk call is retried
    /// independently on `{500, 502, 503, 504}` with exponential backoff, at
    /// most [`CHUNK_RETRY_LIMIT`] times; any other failure aborts the whole
    /// upload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the local file is unreadable, the session
    /// cannot be opened, or a chunk fails terminally.
    #[instrument(skip(self), fields(path = %local.display()))]
    pub async fn upload_file(&self, local: &Path, folder_id: &str) -> Result<String, StoreError> {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::session("?", "local path has no usable file name"))?
            .to_string();

        // Idempotence: a same-named object under the folder wins over a
        // second push.
        if let Some(existing) = self.find_object(&name, Some(folder_id)).await? {
            info!(object = %name, id = %existing, "object already present, skipping upload");
            return Ok(existing);
        }

        let total = tokio::fs::metadata(local)
            .await
            .map_err(|e| StoreError::io(local, e))?
            .len();

        let session_uri = self.open_session(&name, folder_id, local, total).await?;
        debug!(object = %name, total, "resumable session open");

        if total == 0 {
            let outcome = self
                .put_chunk_with_retry(&session_uri, &name, Vec::new(), "bytes */0")
                .await?;
            return match outcome {
                ChunkStatus::Complete(id) => Ok(id),
                ChunkStatus::Incomplete => Err(StoreError::session(
                    name,
                    "session did not complete for an empty object",
                )),
            };
        }

        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| StoreError::io(local, e))?;
        let mut offset: u64 = 0;

        while offset < total {
            let len = usize::try_from((total - offset).min(self.chunk_size as u64))
                .unwrap_or(self.chunk_size);
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| StoreError::io(local, e))?;

            let range = format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total);
            let outcome = self
                .put_chunk_with_retry(&session_uri, &name, buf, &range)
                .await?;

            match outcome {
                ChunkStatus::Complete(id) => {
                    info!(object = %name, id = %id, bytes = total, "upload complete");
                    return Ok(id);
                }
                ChunkStatus::Incomplete => {
                    offset += len as u64;
                    debug!(object = %name, offset, total, "chunk accepted");
                }
            }
        }

        Err(StoreError::session(
            name,
            "server never acknowledged the final chunk",
        ))
    }

    async fn find_with_query(
        &self,
        name: &str,
        parent: Option<&str>,
        mime: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let token = self.token.access_token().await?;

        let mut query = format!("name = '{}' and trashed = false", escape_name(name));
        if let Some(parent) = parent {
            query.push_str(&format!(" and '{parent}' in parents"));
        }
        if let Some(mime) = mime {
            query.push_str(&format!(" and mimeType = '{mime}'"));
        }

        let response = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("fields", "files(id, name)")])
            .send()
            .await
            .map_err(|e| StoreError::network("files.list", e))?;

        if !response.status().is_success() {
            return Err(StoreError::http("files.list", response.status().as_u16()));
        }

        let list: FileList = response
            .json()
            .await
            .map_err(|e| StoreError::network("files.list", e))?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn open_session(
        &self,
        name: &str,
        folder_id: &str,
        local: &Path,
        total: u64,
    ) -> Result<String, StoreError> {
        let token = self.token.access_token().await?;
        let metadata = json!({ "name": name, "parents": [folder_id] });

        let response = self
            .client
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", mime_for_path(local))
            .header("X-Upload-Content-Length", total)
            .json(&metadata)
            .send()
            .await
            .map_err(|e| StoreError::network("upload.session", e))?;

        if !response.status().is_success() {
            return Err(StoreError::http(
                "upload.session",
                response.status().as_u16(),
            ));
        }

        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string)
            .ok_or_else(|| StoreError::session(name, "session response carried no location URI"))
    }

    /// Sends one chunk, retrying independently on the transient status set.
    async fn put_chunk_with_retry(
        &self,
        session_uri: &str,
        name: &str,
        chunk: Vec<u8>,
        content_range: &str,
    ) -> Result<ChunkStatus, StoreError> {
        let result = self
            .chunk_retry
            .execute(
                || self.put_chunk(session_uri, chunk.clone(), content_range),
                classify_chunk_error,
            )
            .await;

        match result {
            Ok(attempted) => {
                if attempted.attempts > 1 {
                    debug!(object = %name, attempts = attempted.attempts, "chunk succeeded after retries");
                }
                Ok(attempted.value)
            }
            Err(retry_error) => {
                warn!(
                    object = %name,
                    attempts = retry_error.attempts(),
                    error = %retry_error.last_error(),
                    "chunk failed terminally, aborting upload"
                );
                Err(retry_error.into_last_error())
            }
        }
    }

    async fn put_chunk(
        &self,
        session_uri: &str,
        chunk: Vec<u8>,
        content_range: &str,
    ) -> Result<ChunkStatus, StoreError> {
        let response = self
            .client
            .put(session_uri)
            .header(reqwest::header::CONTENT_RANGE, content_range)
            .body(chunk)
            .send()
            .await
            .map_err(|e| StoreError::network("upload.chunk", e))?;

        match response.status().as_u16() {
            // 308 Resume Incomplete: the range was stored, keep going.
            308 => Ok(ChunkStatus::Incomplete),
            200 | 201 => {
                let file: FileRef = response
                    .json()
                    .await
                    .map_err(|e| StoreError::network("upload.chunk", e))?;
                Ok(ChunkStatus::Complete(file.id))
            }
            status => Err(StoreError::http("upload.chunk", status)),
        }
    }
}

/// Chunk-level classification: only the configured 5xx set is retryable;
/// anything else aborts the upload.
fn classify_chunk_error(error: &StoreError) -> FailureType {
    match error {
        StoreError::Http { status, .. } if RETRYABLE_CHUNK_STATUSES.contains(status) => {
            FailureType::Transient
        }
        _ => FailureType::Permanent,
    }
}

/// Escapes single quotes for embedding a name in a store query.
fn escape_name(name: &str) -> String {
    name.replace('\'', "\\'")
}

/// Guesses a MIME type from the file extension, octet-stream otherwise.
fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("mp4") => "video/mp4",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_name_quotes() {
        assert_eq!(escape_name("Bob's Course"), "Bob\\'s Course");
        assert_eq!(escape_name("plain"), "plain");
    }

    #[test]
    fn test_mime_for_path_known_extensions() {
        assert_eq!(mime_for_path(Path::new("a.pdf")), "application/pdf");
        assert_eq!(mime_for_path(Path::new("a.MP4")), "video/mp4");
        assert_eq!(mime_for_path(Path::new("a.txt")), "text/plain");
        assert_eq!(
            mime_for_path(Path::new("mystery.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            mime_for_path(Path::new("no-extension")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_classify_chunk_error_retryable_set() {
        for status in RETRYABLE_CHUNK_STATUSES {
            let error = StoreError::http("upload.chunk", status);
            assert_eq!(
                classify_chunk_error(&error),
                FailureType::Transient,
                "status {status} should be retryable"
            );
        }
    }

    #[test]
    fn test_classify_chunk_error_other_statuses_abort() {
        for status in [400, 401, 403, 404, 412, 429] {
            let error = StoreError::http("upload.chunk", status);
            assert_eq!(
                classify_chunk_error(&error),
                FailureType::Permanent,
                "status {status} should abort"
            );
        }
    }

    #[test]
    fn test_classify_chunk_error_network_aborts() {
        // Only the configured server statuses are retried at chunk level.
        let error = StoreError::Credential {
            reason: "x".into(),
        };
        assert_eq!(classify_chunk_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_stored_token_load_missing_file_is_credential_error() {
        let result = StoredToken::load(Path::new("/nonexistent/token.json"));
        assert!(matches!(result, Err(StoreError::Credential { .. })));
    }

    #[test]
    fn test_stored_token_load_malformed_is_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "not json").unwrap();
        let result = StoredToken::load(&path);
        assert!(matches!(result, Err(StoreError::Credential { .. })));
    }

    #[test]
    fn test_stored_token_load_empty_token_is_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, r#"{"access_token": "  "}"#).unwrap();
        let result = StoredToken::load(&path);
        assert!(matches!(result, Err(StoreError::Credential { .. })));
    }

    #[tokio::test]
    async fn test_stored_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, r#"{"access_token": "abc123"}"#).unwrap();
        let token = StoredToken::load(&path).unwrap();
        assert_eq!(token.access_token().await.unwrap(), "abc123");
    }
}
