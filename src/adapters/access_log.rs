use crate::{
    config::models::AccessLogFormat,
    ports::access_log::{AccessLogRecord, AccessLogger},
};

/// Target used for access log events, so they can be filtered or routed separately
pub const ACCESS_LOG_TARGET: &str = "trellis::access";

/// Access logger that emits one `tracing` event per request
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLogger {
    format: AccessLogFormat,
}

impl TracingAccessLogger {
    pub fn new(format: AccessLogFormat) -> Self {
        Self { format }
    }

    /// Render the record as one line in the configured format
    pub fn format_line(&self, record: &AccessLogRecord) -> String {
        match self.format {
            AccessLogFormat::Apache => apache_line(record),
            AccessLogFormat::Json => match serde_json::to_string(record) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Failed to encode access log record: {}", e);
                    apache_line(record)
                }
            },
        }
    }
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}

/// Apache combined log format with the request latency appended
fn apache_line(record: &AccessLogRecord) -> String {
    format!(
        "{} - {} [{}] \"{}\" {} {} \"{}\" \"{}\" {:.3}ms",
        or_dash(&record.remote_addr),
        or_dash(&record.remote_user),
        record.request_time.format("%d/%b/%Y:%H:%M:%S %z"),
        record.request,
        record.status,
        record.body_bytes_sent,
        or_dash(&record.referer),
        or_dash(&record.user_agent),
        record.elapsed.as_secs_f64() * 1000.0,
    )
}

impl AccessLogger for TracingAccessLogger {
    fn record(&self, record: &AccessLogRecord) {
        let line = self.format_line(record);
        tracing::info!(target: ACCESS_LOG_TARGET, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn record() -> AccessLogRecord {
        AccessLogRecord {
            remote_addr: "10.0.0.1".to_string(),
            request_time: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
            method: "GET".to_string(),
            request: "GET /users/7?tab=1 HTTP/1.1".to_string(),
            protocol: "HTTP/1.1".to_string(),
            host: "example.com".to_string(),
            status: 200,
            elapsed: Duration::from_micros(1500),
            referer: String::new(),
            user_agent: "curl/8.0".to_string(),
            remote_user: String::new(),
            body_bytes_sent: 42,
        }
    }

    #[test]
    fn test_apache_format() {
        let line = TracingAccessLogger::new(AccessLogFormat::Apache).format_line(&record());
        assert_eq!(
            line,
            "10.0.0.1 - - [09/Mar/2024:14:05:07 +0000] \"GET /users/7?tab=1 HTTP/1.1\" 200 42 \"-\" \"curl/8.0\" 1.500ms"
        );
    }

    #[test]
    fn test_json_format() {
        let line = TracingAccessLogger::new(AccessLogFormat::Json).format_line(&record());
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], 200);
        assert_eq!(value["host"], "example.com");
        assert_eq!(value["body_bytes_sent"], 42);
        assert!((value["elapsed"].as_f64().unwrap() - 1.5).abs() < 1e-9);
    }
}
