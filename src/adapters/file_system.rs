use std::path::{Component, Path};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use eyre::WrapErr;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::ports::file_system::{DirEntry, FileMeta, FileSystem, FileSystemError, FileSystemResult};

/// File system adapter on tokio::fs, streaming large files through tower-http ServeFile
#[derive(Debug, Default, Clone)]
pub struct FileSystemAdapter;

impl FileSystemAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Static paths are resolved before they reach the adapter; `..` never should
fn reject_traversal(path: &Path) -> FileSystemResult<()> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(FileSystemError::InvalidPath(format!(
            "Path traversal attempt detected: {}",
            path.display()
        )));
    }
    Ok(())
}

impl FileSystem for FileSystemAdapter {
    async fn metadata(&self, path: &Path) -> FileSystemResult<FileMeta> {
        reject_traversal(path)?;
        let meta = tokio::fs::metadata(path).await?;
        Ok(FileMeta {
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            len: meta.len(),
            modified: meta.modified()?,
        })
    }

    async fn read(&self, path: &Path) -> FileSystemResult<Bytes> {
        reject_traversal(path)?;
        let content = tokio::fs::read(path).await?;
        Ok(Bytes::from(content))
    }

    async fn list_directory(&self, path: &Path) -> FileSystemResult<Vec<DirEntry>> {
        reject_traversal(path)?;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let is_dir = entry.file_type().await?.is_dir();
            entries.push(DirEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn serve_file(
        &self,
        path: &Path,
        req: Request<AxumBody>,
    ) -> FileSystemResult<Response<AxumBody>> {
        reject_traversal(path)?;
        let response = ServeFile::new(path)
            .oneshot(req)
            .await
            .wrap_err("ServeFile failed to serve file")
            .map_err(|e| {
                FileSystemError::IoError(std::io::Error::other(format!("ServeFile error: {e}")))
            })?;

        let (parts, tower_body) = response.into_parts();
        let axum_body = AxumBody::new(tower_body.map_err(|e| {
            tracing::error!("Error reading static file body: {}", e);
            axum::Error::new(e)
        }));

        Ok(Response::from_parts(parts, axum_body))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn create_test_file(dir: &TempDir, path: &str, content: &str) -> std::io::Result<()> {
        let full_path = dir.path().join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full_path, content).await
    }

    #[tokio::test]
    async fn test_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemAdapter::new();
        create_test_file(&temp_dir, "test.txt", "content")
            .await
            .unwrap();

        let meta = fs.metadata(&temp_dir.path().join("test.txt")).await.unwrap();
        assert!(meta.is_file);
        assert_eq!(meta.len, 7);

        let dir = fs.metadata(temp_dir.path()).await.unwrap();
        assert!(dir.is_dir);

        let missing = fs.metadata(&temp_dir.path().join("nope")).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_read() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemAdapter::new();
        create_test_file(&temp_dir, "test.txt", "Hello, world!")
            .await
            .unwrap();

        let result = fs.read(&temp_dir.path().join("test.txt")).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"Hello, world!"));
    }

    #[tokio::test]
    async fn test_path_traversal_protection() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemAdapter::new();

        let result = fs.read(&temp_dir.path().join("../sensitive_file.txt")).await;
        assert!(matches!(result, Err(FileSystemError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_list_directory_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemAdapter::new();
        create_test_file(&temp_dir, "b.txt", "2").await.unwrap();
        create_test_file(&temp_dir, "a.txt", "1").await.unwrap();
        create_test_file(&temp_dir, "subdir/c.txt", "3")
            .await
            .unwrap();

        let entries = fs.list_directory(temp_dir.path()).await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "a.txt".to_string(),
                    is_dir: false
                },
                DirEntry {
                    name: "b.txt".to_string(),
                    is_dir: false
                },
                DirEntry {
                    name: "subdir".to_string(),
                    is_dir: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_serve_file_streams_body() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemAdapter::new();
        create_test_file(&temp_dir, "big.txt", "large payload")
            .await
            .unwrap();

        let req = Request::builder()
            .uri("/big.txt")
            .body(AxumBody::empty())
            .unwrap();
        let response = fs
            .serve_file(&temp_dir.path().join("big.txt"), req)
            .await
            .unwrap();
        assert_eq!(response.status(), hyper::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"large payload"));
    }
}
