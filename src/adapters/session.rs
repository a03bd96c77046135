//! In-memory session store keyed by a cookie-carried identifier.
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use cookie::{Cookie, SameSite};
use hyper::{
    HeaderMap,
    header::{self, HeaderValue},
};
use scc::HashMap;
use serde_json::Value;

use crate::{
    config::models::SessionConfig,
    ports::session::{SessionError, SessionHandle, SessionResult, SessionStore},
};

#[derive(Debug, Clone)]
struct SessionRecord {
    values: BTreeMap<String, Value>,
    last_access: Instant,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            last_access: Instant::now(),
        }
    }
}

type Sessions = Arc<HashMap<String, SessionRecord>>;

/// Session store that keeps every session in process memory
pub struct MemorySessionStore {
    config: SessionConfig,
    sessions: Sessions,
}

impl MemorySessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(HashMap::default()),
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than `gc_max_lifetime_secs`; returns how many were removed
    pub async fn gc(&self) -> usize {
        let max_idle = Duration::from_secs(self.config.gc_max_lifetime_secs);
        let mut removed = 0;
        let removed_ref = &mut removed;
        self.sessions
            .retain_async(|_, record| {
                let keep = record.last_access.elapsed() <= max_idle;
                if !keep {
                    *removed_ref += 1;
                }
                keep
            })
            .await;
        if removed > 0 {
            tracing::debug!("Session sweep removed {} idle sessions", removed);
        }
        removed
    }

    /// Sweep idle sessions every `interval` until the task is aborted
    pub fn spawn_gc(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.gc().await;
            }
        })
    }

    fn session_id(&self, request: &HeaderMap) -> Option<String> {
        request
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .find(|c| c.name() == self.config.cookie_name)
            .map(|c| c.value().to_string())
            .filter(|id| !id.is_empty())
    }

    fn set_cookie(&self, response: &mut HeaderMap, id: &str, expire: bool) -> SessionResult<()> {
        let mut cookie = Cookie::build((self.config.cookie_name.clone(), id.to_string()))
            .path("/")
            .http_only(self.config.http_only)
            .same_site(SameSite::Lax)
            .build();
        if expire {
            cookie.make_removal();
        } else if self.config.cookie_lifetime_secs > 0 {
            let secs = i64::try_from(self.config.cookie_lifetime_secs).unwrap_or(i64::MAX);
            cookie.set_max_age(cookie::time::Duration::seconds(secs));
        }
        let value = HeaderValue::from_str(&cookie.to_string())
            .map_err(|e| SessionError::Unavailable(format!("invalid session cookie: {e}")))?;
        response.append(header::SET_COOKIE, value);
        Ok(())
    }

    async fn create(&self, response: &mut HeaderMap, record: SessionRecord) -> SessionResult<String> {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string();
            if self
                .sessions
                .insert_async(id.clone(), record.clone())
                .await
                .is_ok()
            {
                self.set_cookie(response, &id, false)?;
                return Ok(id);
            }
        }
    }

    fn handle(&self, id: String) -> Arc<dyn SessionHandle> {
        Arc::new(MemorySession {
            id,
            sessions: self.sessions.clone(),
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn start(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
    ) -> SessionResult<Arc<dyn SessionHandle>> {
        if let Some(id) = self.session_id(request) {
            let touched = self
                .sessions
                .update_async(&id, |_, record| record.last_access = Instant::now())
                .await;
            if touched.is_some() {
                return Ok(self.handle(id));
            }
        }
        let id = self.create(response, SessionRecord::new()).await?;
        Ok(self.handle(id))
    }

    async fn regenerate_id(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
    ) -> SessionResult<Arc<dyn SessionHandle>> {
        let mut record = SessionRecord::new();
        if let Some(old) = self.session_id(request) {
            if let Some((_, previous)) = self.sessions.remove_async(&old).await {
                record.values = previous.values;
            }
        }
        let id = self.create(response, record).await?;
        Ok(self.handle(id))
    }

    async fn destroy(&self, request: &HeaderMap, response: &mut HeaderMap) -> SessionResult<()> {
        if let Some(id) = self.session_id(request) {
            self.sessions.remove_async(&id).await;
        }
        self.set_cookie(response, "", true)
    }
}

struct MemorySession {
    id: String,
    sessions: Sessions,
}

#[async_trait]
impl SessionHandle for MemorySession {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.sessions
            .read_async(&self.id, |_, record| record.values.get(key).cloned())
            .await
            .flatten()
    }

    async fn set(&self, key: &str, value: Value) -> SessionResult<()> {
        self.sessions
            .update_async(&self.id, |_, record| {
                record.values.insert(key.to_string(), value);
            })
            .await
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))
    }

    async fn delete(&self, key: &str) -> SessionResult<()> {
        self.sessions
            .update_async(&self.id, |_, record| {
                record.values.remove(key);
            })
            .await
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))
    }

    async fn flush(&self) -> SessionResult<()> {
        self.sessions
            .update_async(&self.id, |_, record| record.values.clear())
            .await
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(SessionConfig {
            enabled: true,
            ..SessionConfig::default()
        })
    }

    fn cookie_header(response: &HeaderMap) -> HeaderMap {
        let set_cookie = response[header::SET_COOKIE].to_str().unwrap();
        let pair = set_cookie.split(';').next().unwrap().to_string();
        let mut request = HeaderMap::new();
        request.insert(header::COOKIE, HeaderValue::from_str(&pair).unwrap());
        request
    }

    #[tokio::test]
    async fn test_new_session_sets_cookie() {
        let store = store();
        let mut response = HeaderMap::new();
        let session = store.start(&HeaderMap::new(), &mut response).await.unwrap();

        let set_cookie = response[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with(&format!("trellis_session={}", session.id())));
        assert!(set_cookie.contains("HttpOnly"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_session_resumed_from_cookie() {
        let store = store();
        let mut response = HeaderMap::new();
        let first = store.start(&HeaderMap::new(), &mut response).await.unwrap();
        first.set("user", Value::from("ana")).await.unwrap();

        let request = cookie_header(&response);
        let mut response = HeaderMap::new();
        let second = store.start(&request, &mut response).await.unwrap();

        assert_eq!(second.id(), first.id());
        assert_eq!(second.get("user").await, Some(Value::from("ana")));
        assert!(response.get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_unknown_cookie_starts_fresh_session() {
        let store = store();
        let mut request = HeaderMap::new();
        request.insert(header::COOKIE, HeaderValue::from_static("trellis_session=stale"));
        let mut response = HeaderMap::new();
        let session = store.start(&request, &mut response).await.unwrap();
        assert_ne!(session.id(), "stale");
        assert!(response.get(header::SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn test_regenerate_keeps_values() {
        let store = store();
        let mut response = HeaderMap::new();
        let first = store.start(&HeaderMap::new(), &mut response).await.unwrap();
        first.set("cart", Value::from(3)).await.unwrap();

        let request = cookie_header(&response);
        let mut response = HeaderMap::new();
        let rotated = store.regenerate_id(&request, &mut response).await.unwrap();

        assert_ne!(rotated.id(), first.id());
        assert_eq!(rotated.get("cart").await, Some(Value::from(3)));
        assert!(first.get("cart").await.is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_expires_cookie() {
        let store = store();
        let mut response = HeaderMap::new();
        store.start(&HeaderMap::new(), &mut response).await.unwrap();

        let request = cookie_header(&response);
        let mut response = HeaderMap::new();
        store.destroy(&request, &mut response).await.unwrap();

        assert!(store.is_empty());
        let set_cookie = response[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_gc_removes_idle_sessions() {
        let store = MemorySessionStore::new(SessionConfig {
            gc_max_lifetime_secs: 0,
            ..SessionConfig::default()
        });
        let mut response = HeaderMap::new();
        store.start(&HeaderMap::new(), &mut response).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.gc().await, 1);
        assert!(store.is_empty());
    }
}
