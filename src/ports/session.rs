use std::sync::Arc;

use async_trait::async_trait;
use hyper::HeaderMap;
use thiserror::Error;

/// Error type for session store operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    /// The backing store could not be reached or refused the operation
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    /// The session no longer exists in the store
    #[error("Session {0} not found")]
    NotFound(String),

    /// A value could not be encoded or decoded
    #[error("Session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// A started session bound to one request
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Session identifier as carried by the session cookie
    fn id(&self) -> String;

    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    async fn set(&self, key: &str, value: serde_json::Value) -> SessionResult<()>;

    async fn delete(&self, key: &str) -> SessionResult<()>;

    /// Remove every value from the session
    async fn flush(&self) -> SessionResult<()>;
}

/// SessionStore defines the port for starting, rotating and destroying sessions.
///
/// Implementations read the session identifier from the request headers and write any
/// `Set-Cookie` they need into the response headers.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Resume the session named by the request, or create a new one
    async fn start(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
    ) -> SessionResult<Arc<dyn SessionHandle>>;

    /// Move the current session's values to a fresh identifier
    async fn regenerate_id(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
    ) -> SessionResult<Arc<dyn SessionHandle>>;

    /// Drop the current session and expire its cookie
    async fn destroy(&self, request: &HeaderMap, response: &mut HeaderMap) -> SessionResult<()>;
}
