//! Configuration data structures for trellis.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. Every section
//! carries serde defaults so that a minimal config only has to name what it changes.
//! Builders and enums here are considered part of the public API for embedding.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application environment. Development mode renders diagnostic pages for handler faults.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    #[default]
    Development,
    Production,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvMode::Development => write!(f, "development"),
            EnvMode::Production => write!(f, "production"),
        }
    }
}

/// One `prefix -> directory` mapping for static assets
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StaticDirConfig {
    /// URL prefix, e.g. "/static"
    pub prefix: String,
    /// Directory on disk the prefix maps to
    pub dir: String,
}

impl StaticDirConfig {
    pub fn new(prefix: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            dir: dir.into(),
        }
    }
}

/// Configuration for static file serving and the static asset cache
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StaticFilesConfig {
    /// Ordered prefix mappings; the first prefix with an existing file wins
    pub dirs: Vec<StaticDirConfig>,
    /// Directory holding `favicon.ico` and `robots.txt`
    pub public_dir: String,
    /// Render a listing for directories without an `index.html`
    pub directory_index: bool,
    /// Serve gzip variants of compressible assets
    pub enable_gzip: bool,
    /// File extensions eligible for gzip (case-insensitive suffix match)
    pub gzip_extensions: Vec<String>,
    /// Files larger than this many bytes bypass the cache and are streamed
    pub cache_file_size: u64,
    /// Maximum number of cache entries (clamped to at least 1)
    pub cache_file_num: usize,
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            dirs: vec![StaticDirConfig::new("/static", "static")],
            public_dir: "public".to_string(),
            directory_index: false,
            enable_gzip: false,
            gzip_extensions: vec![".css".to_string(), ".js".to_string()],
            cache_file_size: 100 * 1024,
            cache_file_num: 1000,
        }
    }
}

/// Route matcher behaviour
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Answer 405 with an `Allow` header when a path matched but the method did not.
    /// Off by default, in which case such requests are answered with 404.
    pub method_not_allowed: bool,
}

/// Session cookie settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    pub cookie_name: String,
    /// Lifetime of the session cookie in seconds; 0 keeps it for the browser session
    pub cookie_lifetime_secs: u64,
    /// Idle sessions older than this are removed by the store's sweep
    pub gc_max_lifetime_secs: u64,
    pub http_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: "trellis_session".to_string(),
            cookie_lifetime_secs: 3600,
            gc_max_lifetime_secs: 3600,
            http_only: true,
        }
    }
}

/// Flash messages, CSRF protection and sessions
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub flash_name: String,
    pub flash_separator: String,
    pub enable_xsrf: bool,
    /// HMAC key for the `_xsrf` secure cookie
    pub xsrf_key: String,
    /// Max-Age of the `_xsrf` cookie in seconds; 0 means a browser-session cookie
    pub xsrf_expire: u64,
    pub session: SessionConfig,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            flash_name: "TRELLIS_FLASH".to_string(),
            flash_separator: "TRELLISFLASH".to_string(),
            enable_xsrf: false,
            xsrf_key: "trellisxsrf".to_string(),
            xsrf_expire: 0,
            session: SessionConfig::default(),
        }
    }
}

/// Access log line format
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessLogFormat {
    #[default]
    Apache,
    Json,
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
    /// JSON output instead of the pretty console format
    pub json: bool,
    pub access_logs: bool,
    /// Also record requests for static assets
    pub enable_static_logs: bool,
    pub access_log_format: AccessLogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            access_logs: true,
            enable_static_logs: true,
            access_log_format: AccessLogFormat::Apache,
        }
    }
}

/// Request context pool sizing
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle contexts retained for reuse; extra released contexts are dropped
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 1024 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    pub env_mode: EnvMode,
    pub listen_addr: String,
    /// How long in-flight requests may drain on shutdown, parsed by humantime ("30s", "1m")
    pub shutdown_timeout: String,
    /// Buffer non-upload request bodies in memory (bounded by `max_memory`)
    pub copy_request_body: bool,
    pub max_memory: u64,
    pub max_upload_size: u64,
    pub router: RouterConfig,
    pub static_files: StaticFilesConfig,
    pub web: WebConfig,
    pub log: LogConfig,
    pub pool: PoolConfig,
}

impl AppConfig {
    /// Create a new application configuration builder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    pub fn is_development(&self) -> bool {
        self.env_mode == EnvMode::Development
    }

    /// Parsed shutdown timeout, falling back to 30 seconds when the value is malformed
    pub fn shutdown_timeout(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(30))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "trellis".to_string(),
            env_mode: EnvMode::Development,
            listen_addr: "127.0.0.1:7000".to_string(),
            shutdown_timeout: "30s".to_string(),
            copy_request_body: false,
            max_memory: 1 << 26,
            max_upload_size: 1 << 30,
            router: RouterConfig::default(),
            static_files: StaticFilesConfig::default(),
            web: WebConfig::default(),
            log: LogConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Builder for AppConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    pub fn env_mode(mut self, mode: EnvMode) -> Self {
        self.config.env_mode = mode;
        self
    }

    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn copy_request_body(mut self, enabled: bool) -> Self {
        self.config.copy_request_body = enabled;
        self
    }

    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    pub fn max_upload_size(mut self, bytes: u64) -> Self {
        self.config.max_upload_size = bytes;
        self
    }

    /// Replace the static directory mappings
    pub fn static_dirs(mut self, dirs: Vec<StaticDirConfig>) -> Self {
        self.config.static_files.dirs = dirs;
        self
    }

    /// Append one static directory mapping
    pub fn static_dir(mut self, prefix: impl Into<String>, dir: impl Into<String>) -> Self {
        self.config
            .static_files
            .dirs
            .push(StaticDirConfig::new(prefix, dir));
        self
    }

    pub fn public_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.static_files.public_dir = dir.into();
        self
    }

    pub fn directory_index(mut self, enabled: bool) -> Self {
        self.config.static_files.directory_index = enabled;
        self
    }

    pub fn gzip(mut self, enabled: bool, extensions: &[&str]) -> Self {
        self.config.static_files.enable_gzip = enabled;
        if !extensions.is_empty() {
            self.config.static_files.gzip_extensions =
                extensions.iter().map(|e| e.to_string()).collect();
        }
        self
    }

    pub fn static_cache(mut self, file_size: u64, file_num: usize) -> Self {
        self.config.static_files.cache_file_size = file_size;
        self.config.static_files.cache_file_num = file_num;
        self
    }

    pub fn method_not_allowed(mut self, enabled: bool) -> Self {
        self.config.router.method_not_allowed = enabled;
        self
    }

    /// Enable CSRF protection with the given cookie key and expiry in seconds
    pub fn xsrf(mut self, key: impl Into<String>, expire: u64) -> Self {
        self.config.web.enable_xsrf = true;
        self.config.web.xsrf_key = key.into();
        self.config.web.xsrf_expire = expire;
        self
    }

    pub fn sessions(mut self, enabled: bool) -> Self {
        self.config.web.session.enabled = enabled;
        self
    }

    pub fn access_logs(mut self, enabled: bool, static_logs: bool) -> Self {
        self.config.log.access_logs = enabled;
        self.config.log.enable_static_logs = static_logs;
        self
    }

    pub fn max_idle_contexts(mut self, max_idle: usize) -> Self {
        self.config.pool.max_idle = max_idle;
        self
    }

    /// Build the final AppConfig
    pub fn build(self) -> AppConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.max_upload_size, 1024 * 1024 * 1024);
        assert_eq!(config.static_files.cache_file_size, 100 * 1024);
        assert_eq!(config.static_files.cache_file_num, 1000);
        assert_eq!(config.static_files.dirs[0].prefix, "/static");
        assert!(!config.router.method_not_allowed);
        assert!(config.is_development());
    }

    #[test]
    fn test_builder() {
        let config = AppConfig::builder()
            .env_mode(EnvMode::Production)
            .static_dirs(vec![])
            .static_dir("/assets", "./assets")
            .gzip(true, &[".css"])
            .xsrf("secret", 3600)
            .build();

        assert!(!config.is_development());
        assert_eq!(config.static_files.dirs.len(), 1);
        assert_eq!(config.static_files.gzip_extensions, vec![".css".to_string()]);
        assert!(config.web.enable_xsrf);
        assert_eq!(config.web.xsrf_expire, 3600);
    }

    #[test]
    fn test_shutdown_timeout_parsing() {
        let mut config = AppConfig::default();
        config.shutdown_timeout = "5s".to_string();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));

        config.shutdown_timeout = "soon".to_string();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }
}
