use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::AppConfig;

/// Prefix for environment overrides, e.g. `TRELLIS__LOG__LEVEL=debug`
pub const ENV_PREFIX: &str = "TRELLIS";

/// Load configuration from a file using the config crate, layered with environment overrides.
/// Supports multiple formats: YAML, JSON, TOML, INI.
pub async fn load_config(config_path: &str) -> Result<AppConfig> {
    load_config_sync(config_path)
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<AppConfig> {
    let config_path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            file_format(config_path),
        ))
        .add_source(environment())
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let app_config: AppConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(app_config)
}

/// Defaults plus environment overrides, used when no config file exists
pub fn load_env_only() -> Result<AppConfig> {
    let settings = Config::builder()
        .add_source(environment())
        .build()
        .context("Failed to read configuration from the environment")?;

    settings
        .try_deserialize()
        .context("Failed to deserialize configuration from the environment")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{AccessLogFormat, EnvMode};

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
app_name = "shop"
env_mode = "production"
listen_addr = "127.0.0.1:3000"
copy_request_body = true

[static_files]
enable_gzip = true
cache_file_num = 16

[[static_files.dirs]]
prefix = "/assets"
dir = "./assets"

[log]
access_log_format = "json"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.app_name, "shop");
        assert_eq!(config.env_mode, EnvMode::Production);
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert!(config.copy_request_body);
        assert!(config.static_files.enable_gzip);
        assert_eq!(config.static_files.cache_file_num, 16);
        assert_eq!(config.static_files.dirs.len(), 1);
        assert_eq!(config.static_files.dirs[0].prefix, "/assets");
        assert_eq!(config.log.access_log_format, AccessLogFormat::Json);
        // untouched sections keep their defaults
        assert_eq!(config.max_memory, 1 << 26);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "web": {
    "enable_xsrf": true,
    "xsrf_key": "k"
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert!(config.web.enable_xsrf);
        assert_eq!(config.web.xsrf_key, "k");
        assert_eq!(config.web.flash_name, "TRELLIS_FLASH");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        assert!(load_config("/nonexistent/trellis.toml").await.is_err());
    }
}
