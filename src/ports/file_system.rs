use std::{path::Path, time::SystemTime};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use hyper::{Request, Response};
use thiserror::Error;

/// Error type for file system operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FileSystemError {
    /// Error when encountering an IO issue
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error when path is invalid
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl FileSystemError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FileSystemError::IoError(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for file system operations
pub type FileSystemResult<T> = Result<T, FileSystemError>;

/// The subset of a stat result the static file service relies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    pub modified: SystemTime,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// FileSystem defines the port (interface) for reading static assets
pub trait FileSystem: Send + Sync + 'static {
    /// Stat a path
    fn metadata(
        &self,
        path: &Path,
    ) -> impl std::future::Future<Output = FileSystemResult<FileMeta>> + Send;

    /// Read a whole file into memory
    fn read(&self, path: &Path) -> impl std::future::Future<Output = FileSystemResult<Bytes>> + Send;

    /// List the entries of a directory, sorted by name
    fn list_directory(
        &self,
        path: &Path,
    ) -> impl std::future::Future<Output = FileSystemResult<Vec<DirEntry>>> + Send;

    /// Stream a file that is too large for the cache
    ///
    /// # Arguments
    /// * `path` - The file on disk
    /// * `req` - A body-less copy of the original request, used for range and
    ///   conditional headers
    ///
    /// # Returns
    /// A future that resolves to the file response or an error
    fn serve_file(
        &self,
        path: &Path,
        req: Request<AxumBody>,
    ) -> impl std::future::Future<Output = FileSystemResult<Response<AxumBody>>> + Send;
}
