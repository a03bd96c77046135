//! Static file service in front of the router.
//!
//! GET and HEAD requests whose cleaned path falls under a configured prefix are answered
//! from disk. Files up to `cache_file_size` bytes go through the [`StaticCache`]; larger
//! files are streamed by the file system adapter. Anything that does not resolve to an
//! existing path falls through to routing.
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use hyper::{Method, Request, StatusCode};

use crate::{
    config::models::StaticFilesConfig,
    core::{
        content::serve_content,
        context::RequestContext,
        errors::html_escape,
        static_cache::{CacheEntry, CacheKey, Encoding, StaticCache},
    },
    ports::file_system::{FileMeta, FileSystem},
};

/// What the static service did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticOutcome {
    /// Not a static request; continue with routing
    NotStatic,
    /// A response was written
    Served,
    /// Answer with the error page for this status
    Abort(StatusCode),
}

/// Normalize a URL path: resolve `.` and `..`, collapse slashes, drop the trailing slash
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Preferred encoding from `Accept-Encoding`, honouring q-values
pub fn negotiate_encoding(accept_encoding: &str) -> Encoding {
    let mut gzip_q: Option<f32> = None;
    let mut wildcard_q: Option<f32> = None;
    let mut identity_q: Option<f32> = None;

    for item in accept_encoding.split(',') {
        let mut params = item.split(';');
        let coding = params.next().unwrap_or_default().trim().to_ascii_lowercase();
        let q = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        match coding.as_str() {
            "gzip" | "x-gzip" => gzip_q = Some(q),
            "*" => wildcard_q = Some(q),
            "identity" => identity_q = Some(q),
            _ => {}
        }
    }

    let gzip = gzip_q.or(wildcard_q).unwrap_or(0.0);
    if gzip > 0.0 && identity_q.is_none_or(|identity| gzip >= identity) {
        Encoding::Gzip
    } else {
        Encoding::Identity
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

pub struct StaticFiles<F: FileSystem> {
    fs: Arc<F>,
    config: StaticFilesConfig,
    /// `(prefix without trailing slash, dir)` in configuration order
    dirs: Vec<(String, PathBuf)>,
    cache: StaticCache,
}

impl<F: FileSystem> StaticFiles<F> {
    pub fn new(config: StaticFilesConfig, fs: Arc<F>) -> Self {
        let dirs = config
            .dirs
            .iter()
            .map(|d| {
                let prefix = d.prefix.trim_end_matches('/');
                let prefix = if prefix.is_empty() { "/" } else { prefix };
                (prefix.to_string(), PathBuf::from(&d.dir))
            })
            .collect();
        let cache = StaticCache::new(config.cache_file_num, config.cache_file_size);
        Self {
            fs,
            config,
            dirs,
            cache,
        }
    }

    pub fn cache(&self) -> &StaticCache {
        &self.cache
    }

    /// Whether `path` looks like a static asset request, used by the access log filter
    pub fn is_static_path(&self, path: &str) -> bool {
        let path = clean_path(path);
        path == "/favicon.ico"
            || path == "/robots.txt"
            || self
                .dirs
                .iter()
                .any(|(prefix, _)| prefix_matches(prefix, &path))
    }

    /// Filesystem candidates for a cleaned URL path, in lookup order
    fn candidates(&self, path: &str) -> Vec<PathBuf> {
        if path == "/favicon.ico" || path == "/robots.txt" {
            return vec![Path::new(&self.config.public_dir).join(&path[1..])];
        }
        self.dirs
            .iter()
            .filter(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(prefix, dir)| {
                let rest = if prefix == "/" {
                    path
                } else {
                    &path[prefix.len()..]
                };
                let rest = rest.trim_start_matches('/');
                if rest.is_empty() {
                    dir.clone()
                } else {
                    dir.join(rest)
                }
            })
            .collect()
    }

    async fn lookup(&self, path: &str) -> Option<(PathBuf, FileMeta)> {
        for candidate in self.candidates(path) {
            match self.fs.metadata(&candidate).await {
                Ok(meta) => return Some((candidate, meta)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::debug!("Static stat failed for {}: {}", candidate.display(), e);
                    continue;
                }
            }
        }
        None
    }

    /// Try to answer the request from the static directories
    pub async fn serve(&self, ctx: &mut RequestContext) -> StaticOutcome {
        let method = ctx.input.method().clone();
        if method != Method::GET && method != Method::HEAD {
            return StaticOutcome::NotStatic;
        }
        let raw_path = ctx.input.path().to_string();
        let Ok(decoded) = urlencoding::decode(&raw_path) else {
            return StaticOutcome::NotStatic;
        };
        let path = clean_path(&decoded);
        let reserved = path == "/favicon.ico" || path == "/robots.txt";

        let Some((file_path, meta)) = self.lookup(&path).await else {
            if reserved {
                // reserved names never reach the router
                ctx.text(StatusCode::NOT_FOUND, "404 page not found");
                return StaticOutcome::Served;
            }
            return StaticOutcome::NotStatic;
        };

        if meta.is_dir {
            return self.serve_directory(ctx, &raw_path, &file_path).await;
        }
        self.serve_file(ctx, &file_path, meta).await
    }

    async fn serve_directory(
        &self,
        ctx: &mut RequestContext,
        raw_path: &str,
        dir: &Path,
    ) -> StaticOutcome {
        if !raw_path.ends_with('/') {
            let mut location = format!("{raw_path}/");
            if let Some(query) = ctx.input.query_string() {
                location.push('?');
                location.push_str(query);
            }
            return match ctx.redirect(StatusCode::FOUND, &location) {
                Ok(()) => StaticOutcome::Served,
                Err(_) => StaticOutcome::Abort(StatusCode::BAD_REQUEST),
            };
        }

        let index = dir.join("index.html");
        if let Ok(meta) = self.fs.metadata(&index).await {
            if meta.is_file {
                return self.serve_file(ctx, &index, meta).await;
            }
        }

        if !self.config.directory_index {
            return StaticOutcome::Abort(StatusCode::FORBIDDEN);
        }

        match self.fs.list_directory(dir).await {
            Ok(entries) => {
                let mut listing = String::from("<pre>\n");
                for entry in entries {
                    let name = if entry.is_dir {
                        format!("{}/", entry.name)
                    } else {
                        entry.name
                    };
                    listing.push_str(&format!(
                        "<a href=\"{}\">{}</a>\n",
                        urlencoding::encode(&name).replace("%2F", "/"),
                        html_escape(&name)
                    ));
                }
                listing.push_str("</pre>\n");
                if *ctx.input.method() == Method::HEAD {
                    ctx.write_header(StatusCode::OK);
                } else {
                    ctx.html(StatusCode::OK, listing);
                }
                StaticOutcome::Served
            }
            Err(e) => {
                tracing::warn!("Cannot list directory {}: {}", dir.display(), e);
                ctx.text(StatusCode::NOT_FOUND, "404 page not found");
                StaticOutcome::Served
            }
        }
    }

    fn gzip_eligible(&self, file_path: &Path) -> bool {
        if !self.config.enable_gzip {
            return false;
        }
        let name = file_path.to_string_lossy().to_lowercase();
        self.config
            .gzip_extensions
            .iter()
            .any(|ext| name.ends_with(&ext.to_lowercase()))
    }

    async fn serve_file(
        &self,
        ctx: &mut RequestContext,
        file_path: &Path,
        meta: FileMeta,
    ) -> StaticOutcome {
        if meta.len > self.cache.max_file_size() {
            return self.stream_file(ctx, file_path).await;
        }

        let encoding = if self.gzip_eligible(file_path) {
            negotiate_encoding(ctx.input.header(hyper::header::ACCEPT_ENCODING).unwrap_or_default())
        } else {
            Encoding::Identity
        };
        let key = CacheKey::new(encoding, file_path);

        let entry = match self.cache.lookup(&key, meta.modified, meta.len) {
            Some(entry) => entry,
            None => match self.populate(file_path, encoding, meta).await {
                Ok(entry) => self.cache.fill(key, entry),
                Err(e) => {
                    tracing::warn!("Cannot read static file {}: {}", file_path.display(), e);
                    ctx.text(StatusCode::NOT_FOUND, "404 page not found");
                    return StaticOutcome::Served;
                }
            },
        };

        let response = serve_content(ctx.input.method(), ctx.input.headers(), file_path, &entry);
        ctx.send_response(response);
        StaticOutcome::Served
    }

    async fn populate(
        &self,
        file_path: &Path,
        encoding: Encoding,
        meta: FileMeta,
    ) -> eyre::Result<CacheEntry> {
        let raw = self.fs.read(file_path).await?;
        let data = match encoding {
            Encoding::Identity => raw,
            Encoding::Gzip => gzip(&raw)?,
        };
        Ok(CacheEntry::new(data, meta.modified, meta.len, encoding))
    }

    async fn stream_file(&self, ctx: &mut RequestContext, file_path: &Path) -> StaticOutcome {
        let mut builder = Request::builder()
            .method(ctx.input.method().clone())
            .uri(ctx.input.uri().clone())
            .version(ctx.input.version());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(ctx.input.headers().clone());
        }
        let req = match builder.body(AxumBody::empty()) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("Cannot build static file request: {}", e);
                return StaticOutcome::Abort(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        match self.fs.serve_file(file_path, req).await {
            Ok(response) => {
                ctx.send_response(response);
                StaticOutcome::Served
            }
            Err(e) => {
                tracing::warn!("Cannot stream static file {}: {}", file_path.display(), e);
                ctx.text(StatusCode::NOT_FOUND, "404 page not found");
                StaticOutcome::Served
            }
        }
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    prefix == "/"
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapters::file_system::FileSystemAdapter, config::models::StaticDirConfig};

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/static/./css//app.css"), "/static/css/app.css");
        assert_eq!(clean_path("/static/../../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_path("/static/dir/"), "/static/dir");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn test_negotiate_encoding() {
        assert_eq!(negotiate_encoding("gzip, deflate, br"), Encoding::Gzip);
        assert_eq!(negotiate_encoding("gzip;q=0"), Encoding::Identity);
        assert_eq!(negotiate_encoding("deflate"), Encoding::Identity);
        assert_eq!(negotiate_encoding("*;q=0.5"), Encoding::Gzip);
        assert_eq!(negotiate_encoding("gzip;q=0.2, identity;q=0.8"), Encoding::Identity);
        assert_eq!(negotiate_encoding(""), Encoding::Identity);
    }

    #[test]
    fn test_prefix_boundaries() {
        let config = StaticFilesConfig {
            dirs: vec![
                StaticDirConfig::new("/static", "assets"),
                StaticDirConfig::new("/s/", "short"),
            ],
            ..StaticFilesConfig::default()
        };
        let files = StaticFiles::new(config, Arc::new(FileSystemAdapter::new()));

        assert_eq!(
            files.candidates("/static/css/app.css"),
            vec![PathBuf::from("assets/css/app.css")]
        );
        assert!(files.candidates("/staticfile").is_empty());
        assert_eq!(files.candidates("/s/x.js"), vec![PathBuf::from("short/x.js")]);
        assert_eq!(
            files.candidates("/favicon.ico"),
            vec![PathBuf::from("public/favicon.ico")]
        );

        assert!(files.is_static_path("/static/app.css"));
        assert!(files.is_static_path("/robots.txt"));
        assert!(!files.is_static_path("/users"));
    }
}
