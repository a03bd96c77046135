use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;

use crate::config::models::{AppConfig, LogConfig, StaticFilesConfig, WebConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Static directory conflict detected: {message}")]
    StaticDirConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Application configuration validator
pub struct AppConfigValidator;

impl AppConfigValidator {
    /// Validate the entire application configuration, reporting every problem found
    pub fn validate(config: &AppConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if humantime::parse_duration(&config.shutdown_timeout).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "shutdown_timeout".to_string(),
                message: format!(
                    "'{}' is not a duration (use units like 500ms, 30s, 1m)",
                    config.shutdown_timeout
                ),
            });
        }

        if config.max_memory == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_memory".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.max_upload_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_upload_size".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Err(mut static_errors) = Self::validate_static_files(&config.static_files) {
            errors.append(&mut static_errors);
        }

        if let Err(mut web_errors) = Self::validate_web(&config.web) {
            errors.append(&mut web_errors);
        }

        if let Err(e) = Self::validate_log(&config.log) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_static_files(config: &StaticFilesConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (i, entry) in config.dirs.iter().enumerate() {
            if !entry.prefix.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("static_files.dirs[{i}].prefix"),
                    message: format!("Prefix '{}' must start with '/'", entry.prefix),
                });
            }
            if entry.dir.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("static_files.dirs[{i}].dir"),
                });
            }
            let normalized = entry.prefix.trim_end_matches('/');
            if !seen.insert(normalized.to_string()) {
                errors.push(ValidationError::StaticDirConflict {
                    message: format!("Prefix '{}' is mapped more than once", entry.prefix),
                });
            }
        }

        for ext in &config.gzip_extensions {
            if !ext.starts_with('.') {
                errors.push(ValidationError::InvalidField {
                    field: "static_files.gzip_extensions".to_string(),
                    message: format!("Extension '{ext}' must start with '.'"),
                });
            }
        }

        if config.cache_file_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "static_files.cache_file_size".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_web(config: &WebConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.enable_xsrf && config.xsrf_key.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "web.xsrf_key".to_string(),
            });
        }

        if config.flash_name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "web.flash_name".to_string(),
            });
        }

        if config.flash_separator.is_empty() || config.flash_separator.contains('#') {
            errors.push(ValidationError::InvalidField {
                field: "web.flash_separator".to_string(),
                message: "Must be non-empty and must not contain '#'".to_string(),
            });
        }

        if config.session.enabled && config.session.cookie_name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "web.session.cookie_name".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_log(config: &LogConfig) -> ValidationResult<()> {
        tracing_subscriber::EnvFilter::try_new(&config.level).map_err(|e| {
            ValidationError::InvalidField {
                field: "log.level".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::StaticDirConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = AppConfig::builder().listen_addr("localhost").build();
        let err = AppConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Invalid listen address"));
    }

    #[test]
    fn test_static_prefix_rules() {
        let config = AppConfig::builder()
            .static_dirs(vec![
                StaticDirConfig::new("assets", "./assets"),
                StaticDirConfig::new("/static", "./a"),
                StaticDirConfig::new("/static/", "./b"),
            ])
            .build();
        let message = AppConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("Found 2 validation errors"));
        assert!(message.contains("must start with '/'"));
        assert!(message.contains("mapped more than once"));
    }

    #[test]
    fn test_xsrf_requires_key() {
        let config = AppConfig::builder().xsrf("", 0).build();
        let message = AppConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("web.xsrf_key"));
    }

    #[test]
    fn test_bad_gzip_extension_and_timeout() {
        let mut config = AppConfig::builder().gzip(true, &["css"]).build();
        config.shutdown_timeout = "forever".to_string();
        let message = AppConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("gzip_extensions"));
        assert!(message.contains("shutdown_timeout"));
    }
}
