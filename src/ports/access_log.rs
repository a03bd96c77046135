use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One access log line worth of request data
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogRecord {
    pub remote_addr: String,
    pub request_time: DateTime<Utc>,
    pub method: String,
    /// Request line, e.g. `GET /index.html HTTP/1.1`
    pub request: String,
    pub protocol: String,
    pub host: String,
    pub status: u16,
    #[serde(serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
    pub referer: String,
    pub user_agent: String,
    pub remote_user: String,
    pub body_bytes_sent: u64,
}

fn serialize_elapsed<S: serde::Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(elapsed.as_secs_f64() * 1000.0)
}

/// AccessLogger defines the port for recording finished requests.
///
/// Recording is fire-and-forget: implementations must not block the request for long
/// and must swallow their own failures.
pub trait AccessLogger: Send + Sync + 'static {
    fn record(&self, record: &AccessLogRecord);
}
