use std::io;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

/// Streamed body of a remote GET.
pub type RemoteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// A remote GET in flight: the advertised length of the remaining body (when
/// the server reports one) and the byte stream itself.
pub struct RemoteGet {
    pub content_length: Option<u64>,
    pub stream: RemoteStream,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status}: {message}")]
    Server { status: StatusCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn server(status: StatusCode, message: impl Into<String>) -> Self {
        RemoteError::Server {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RemoteError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn classification(&self) -> RemoteErrorClass {
        match self {
            RemoteError::Server { status, .. } => classify_status(*status),
            // transport-level failures are worth retrying next sync
            RemoteError::Request(_) => RemoteErrorClass::Transient,
            RemoteError::Url(_) => RemoteErrorClass::Permanent,
        }
    }
}

// 403 stays per-item so the shared-directory recovery can intercept it.
fn classify_status(status: StatusCode) -> RemoteErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        RemoteErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        RemoteErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        RemoteErrorClass::Transient
    } else {
        RemoteErrorClass::Permanent
    }
}

/// Metadata the server reports for a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub remote_perm: Option<String>,
    pub size: i64,
    pub modtime: i64,
    pub is_directory: bool,
}

/// Result of finalising an NG upload session.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Done(RemoteInfo),
    /// The server will assemble the file asynchronously; poll this URL.
    Pending(Url),
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending,
    Done(RemoteInfo),
    Failed(String),
}

/// The WebDAV transport, as far as the propagation core needs it.
/// Implementations own authentication, TLS and the wire formats.
#[async_trait]
pub trait RemoteOps: Send + Sync {
    /// PROPFIND with depth 0.
    async fn stat(&self, path: &str) -> Result<RemoteInfo, RemoteError>;

    async fn mkcol(&self, path: &str) -> Result<RemoteInfo, RemoteError>;

    async fn move_item(&self, from: &str, to: &str) -> Result<RemoteInfo, RemoteError>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    /// GET starting at `offset`, for resumed downloads.
    async fn get(&self, path: &str, offset: u64) -> Result<RemoteGet, RemoteError>;

    /// Single-request PUT for files below the chunking threshold.
    async fn put(&self, path: &str, data: Bytes, modtime: i64) -> Result<RemoteInfo, RemoteError>;

    /// Legacy chunking: one PUT per chunk under a client-chosen transfer id.
    /// The server reports the assembled file's metadata with the last chunk.
    async fn put_chunk_v1(
        &self,
        path: &str,
        transfer_id: u64,
        chunk: u32,
        chunk_count: u32,
        data: Bytes,
        modtime: i64,
    ) -> Result<Option<RemoteInfo>, RemoteError>;

    /// Next-generation chunking: an upload session keyed by the transfer id.
    async fn create_upload_session(&self, path: &str, transfer_id: u64)
    -> Result<(), RemoteError>;

    async fn put_session_chunk(
        &self,
        transfer_id: u64,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError>;

    /// MOVE the assembled session content onto its destination.
    async fn finalize_upload_session(
        &self,
        transfer_id: u64,
        path: &str,
        modtime: i64,
    ) -> Result<UploadOutcome, RemoteError>;

    async fn poll(&self, url: &Url) -> Result<PollOutcome, RemoteError>;
}

/// Local filesystem primitives the propagation core relies on.
#[async_trait]
pub trait LocalOps: Send + Sync {
    async fn mkdir(&self, path: &Path) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
    async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    async fn metadata(&self, path: &Path) -> io::Result<std::fs::Metadata>;

    /// Free bytes on the volume holding `path`; `None` when unknown.
    fn free_space(&self, path: &Path) -> Option<i64>;

    fn is_case_preserving(&self) -> bool;

    /// Whether creating `path` would clash with an existing sibling that
    /// differs only by case.
    fn has_case_clash(&self, path: &Path) -> bool;
}

/// Default `LocalOps` backed by the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdLocalOps;

#[async_trait]
impl LocalOps for StdLocalOps {
    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<std::fs::Metadata> {
        tokio::fs::metadata(path).await
    }

    fn free_space(&self, path: &Path) -> Option<i64> {
        free_space_impl(path)
    }

    fn is_case_preserving(&self) -> bool {
        cfg!(any(target_os = "macos", target_os = "windows"))
    }

    fn has_case_clash(&self, path: &Path) -> bool {
        // On macOS the canonical path carries the on-disk casing.
        #[cfg(target_os = "macos")]
        if let Ok(canonical) = std::fs::canonicalize(path)
            && canonical.file_name() != path.file_name()
        {
            return true;
        }

        let Some(parent) = path.parent() else {
            return false;
        };
        let Some(name) = path.file_name() else {
            return false;
        };
        let wanted = name.to_string_lossy().to_lowercase();
        let Ok(entries) = std::fs::read_dir(parent) else {
            return false;
        };
        for entry in entries.flatten() {
            let existing = entry.file_name();
            if existing.as_os_str() != name && existing.to_string_lossy().to_lowercase() == wanted {
                return true;
            }
        }
        false
    }
}

#[cfg(unix)]
fn free_space_impl(path: &Path) -> Option<i64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some((stat.f_bavail as i64).saturating_mul(stat.f_frsize as i64))
}

#[cfg(not(unix))]
fn free_space_impl(_path: &Path) -> Option<i64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RemoteErrorClass::Auth
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RemoteErrorClass::Permanent
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RemoteErrorClass::RateLimit
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RemoteErrorClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RemoteErrorClass::Permanent
        );
    }

    #[test]
    fn detects_case_clash_in_directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Readme.txt"), b"x").unwrap();

        let ops = StdLocalOps;
        assert!(ops.has_case_clash(&dir.path().join("README.TXT")));
        assert!(!ops.has_case_clash(&dir.path().join("Readme.txt")));
        assert!(!ops.has_case_clash(&dir.path().join("other.txt")));
    }

    #[test]
    fn reports_free_space_on_unix() {
        if cfg!(unix) {
            let space = StdLocalOps.free_space(Path::new("/"));
            assert!(space.is_some());
        }
    }
}
