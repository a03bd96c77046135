//! Per-request state: the input facade, the output accessor, the response writer and the
//! view state handed to templates.
//!
//! Contexts are pooled (see [`crate::core::pool`]) and recycled across requests, so
//! [`RequestContext::reset`] must clear every field that a request can write.
//! [`RequestContext::snapshot`] captures the observable state for comparing a recycled
//! context against a fresh one.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::SocketAddr,
    sync::Arc,
};

use axum::body::Body as AxumBody;
use bytes::{Bytes, BytesMut};
use cookie::Cookie;
use hyper::{
    HeaderMap, Method, Response, StatusCode, Uri, Version,
    header::{self, HeaderName, HeaderValue, IntoHeaderName},
    http::request::Parts,
};
use serde::Serialize;
use serde_json::Value;
use sync_wrapper::SyncWrapper;

use crate::{
    config::models::{EnvMode, WebConfig},
    core::{
        controller::{ActionResult, Interrupt},
        xsrf,
    },
    ports::{
        session::{SessionHandle, SessionStore},
        template::{TemplateRenderer, View},
    },
};

/// Collaborators and settings shared by every context of one multiplexer
pub struct ContextServices {
    pub web: WebConfig,
    pub env_mode: EnvMode,
    pub renderer: Option<Arc<dyn TemplateRenderer>>,
    pub sessions: Option<Arc<dyn SessionStore>>,
}

impl Default for ContextServices {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            env_mode: EnvMode::Development,
            renderer: None,
            sessions: None,
        }
    }
}

/// A file received in a `multipart/form-data` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Read side of the request
pub struct Input {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) form: Vec<(String, String)>,
    pub(crate) files: Vec<UploadedFile>,
    pub(crate) body: Bytes,
    data: HashMap<String, Value>,
    pub(crate) session: Option<Arc<dyn SessionHandle>>,
}

impl Input {
    fn new() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            remote_addr: None,
            params: Vec::new(),
            form: Vec::new(),
            files: Vec::new(),
            body: Bytes::new(),
            data: HashMap::new(),
            session: None,
        }
    }

    fn reset(&mut self, parts: Parts, remote_addr: Option<SocketAddr>) {
        self.method = parts.method;
        self.uri = parts.uri;
        self.version = parts.version;
        self.headers = parts.headers;
        self.remote_addr = remote_addr;
        self.params.clear();
        self.form.clear();
        self.files.clear();
        self.body = Bytes::new();
        self.data.clear();
        self.session = None;

        if let Some(query) = self.uri.query() {
            self.form.extend(
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Client address, preferring the first `X-Forwarded-For` hop
    pub fn ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
        if let Some(real_ip) = self.header("x-real-ip") {
            return real_ip.trim().to_string();
        }
        self.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.header(header::HOST)
            .or_else(|| self.uri.host())
            .unwrap_or_default()
    }

    pub fn user_agent(&self) -> &str {
        self.header(header::USER_AGENT).unwrap_or_default()
    }

    pub fn referer(&self) -> &str {
        self.header(header::REFERER).unwrap_or_default()
    }

    pub fn content_type(&self) -> &str {
        self.header(header::CONTENT_TYPE).unwrap_or_default()
    }

    /// Declared `Content-Length`, if present and well formed
    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_upload(&self) -> bool {
        self.content_type()
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
    }

    pub fn is_ajax(&self) -> bool {
        self.header("x-requested-with") == Some("XMLHttpRequest")
    }

    pub fn accepts_html(&self) -> bool {
        self.header(header::ACCEPT)
            .is_some_and(|accept| accept.contains("text/html"))
    }

    pub fn accepts_json(&self) -> bool {
        self.header(header::ACCEPT)
            .is_some_and(|accept| accept.contains("application/json"))
    }

    /// Value of a request cookie
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .find(|c| c.name() == name)
            .map(|c| c.value().to_string())
    }

    /// A captured route variable
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Captured route variables in declaration order
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Add or replace a route variable
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let (name, value) = (name.into(), value.into());
        match self.params.iter_mut().find(|(k, _)| *k == name) {
            Some((_, existing)) => *existing = value,
            None => self.params.push((name, value)),
        }
    }

    /// Route variable, then query string or form field
    pub fn query(&self, name: &str) -> Option<&str> {
        self.param(name).or_else(|| {
            self.form
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        })
    }

    /// Every query string or form value for `name`
    pub fn query_all(&self, name: &str) -> Vec<&str> {
        self.form
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn form(&self) -> &[(String, String)] {
        &self.form
    }

    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    pub fn file(&self, field: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.field == field)
    }

    /// Raw request body, populated when body buffering is enabled
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Per-request key/value store
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn session(&self) -> Option<&Arc<dyn SessionHandle>> {
        self.session.as_ref()
    }
}

/// Response status and headers set by handlers
#[derive(Debug, Default)]
pub struct Output {
    status: Option<StatusCode>,
    headers: HeaderMap,
}

impl Output {
    fn reset(&mut self) {
        self.status = None;
        self.headers.clear();
    }

    /// Explicit status, applied when the response is finalized
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn insert_header<K: IntoHeaderName>(&mut self, key: K, value: HeaderValue) {
        self.headers.insert(key, value);
    }

    /// Set a header from strings, failing on invalid names or values
    pub fn header(&mut self, key: &str, value: &str) -> ActionResult {
        let name = HeaderName::from_bytes(key.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn cookie(&mut self, cookie: &Cookie<'_>) {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                self.headers.append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!("Dropping unencodable cookie {}: {}", cookie.name(), e),
        }
    }
}

/// Response body accumulated during the request
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Buffered(BytesMut),
    // The wrapper keeps the pooled context `Sync`; the stream is only touched through `&mut`
    Stream(SyncWrapper<AxumBody>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Buffered(buf) => f.debug_tuple("Buffered").field(buf).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl ResponseBody {
    fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Empty => "empty",
            ResponseBody::Buffered(_) => "buffered",
            ResponseBody::Stream(_) => "stream",
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Buffered(buf) => Some(buf.len()),
            ResponseBody::Stream(_) => None,
        }
    }
}

/// Tracks whether the response has started so the status line is written once
#[derive(Debug, Default)]
pub struct ResponseWriter {
    started: bool,
    status: Option<StatusCode>,
    body: ResponseBody,
}

impl ResponseWriter {
    fn reset(&mut self) {
        self.started = false;
        self.status = None;
        self.body = ResponseBody::Empty;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Status written when the response started
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Bytes buffered so far; streams report 0
    pub fn bytes_buffered(&self) -> u64 {
        self.body.len().unwrap_or(0) as u64
    }
}

/// Template state for the current request
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ViewState {
    pub data: serde_json::Map<String, Value>,
    /// One-shot messages read from, or to be stored in, the flash cookie
    pub flash: BTreeMap<String, String>,
    pub template: Option<String>,
    pub layout: Option<String>,
    pub sections: BTreeMap<String, String>,
    pub controller_name: String,
    pub action_name: String,
}

impl ViewState {
    fn reset(&mut self) {
        self.data.clear();
        self.flash.clear();
        self.template = None;
        self.layout = None;
        self.sections.clear();
        self.controller_name.clear();
        self.action_name.clear();
    }

    /// `{controller}/{action}.tpl` unless a template was chosen explicitly
    pub fn template_name(&self) -> String {
        if let Some(template) = &self.template {
            return template.clone();
        }
        let action = self.action_name.to_lowercase();
        if self.controller_name.is_empty() {
            format!("{action}.tpl")
        } else {
            format!("{}/{action}.tpl", self.controller_name.to_lowercase())
        }
    }
}

/// Observable state of a context, for comparing a recycled context with a fresh one
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub remote_addr: Option<SocketAddr>,
    pub params: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub files: Vec<UploadedFile>,
    pub body: Bytes,
    pub data: BTreeMap<String, Value>,
    pub has_session: bool,
    pub output_status: Option<u16>,
    pub output_headers: Vec<(String, String)>,
    pub started: bool,
    pub written_status: Option<u16>,
    pub body_kind: &'static str,
    pub body_len: Option<usize>,
    pub view: ViewState,
    pub xsrf_token: Option<String>,
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// The pooled per-request bundle
pub struct RequestContext {
    pub input: Input,
    pub output: Output,
    pub response: ResponseWriter,
    pub view: ViewState,
    xsrf_token: Option<String>,
    services: Arc<ContextServices>,
}

impl RequestContext {
    pub fn new(services: Arc<ContextServices>) -> Self {
        Self {
            input: Input::new(),
            output: Output::default(),
            response: ResponseWriter::default(),
            view: ViewState::default(),
            xsrf_token: None,
            services,
        }
    }

    /// Rebind the context to a new request and clear everything the previous one wrote
    pub fn reset(&mut self, parts: Parts, remote_addr: Option<SocketAddr>) {
        self.input.reset(parts, remote_addr);
        self.output.reset();
        self.response.reset();
        self.view.reset();
        self.xsrf_token = None;
    }

    pub fn services(&self) -> &ContextServices {
        &self.services
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            method: self.input.method.to_string(),
            uri: self.input.uri.to_string(),
            headers: header_pairs(&self.input.headers),
            remote_addr: self.input.remote_addr,
            params: self.input.params.clone(),
            form: self.input.form.clone(),
            files: self.input.files.clone(),
            body: self.input.body.clone(),
            data: self
                .input
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            has_session: self.input.session.is_some(),
            output_status: self.output.status.map(|s| s.as_u16()),
            output_headers: header_pairs(&self.output.headers),
            started: self.response.started,
            written_status: self.response.status.map(|s| s.as_u16()),
            body_kind: self.response.body.kind(),
            body_len: self.response.body.len(),
            view: self.view.clone(),
            xsrf_token: self.xsrf_token.clone(),
        }
    }

    /// Start the response with `status`. Later calls are ignored.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.response.started {
            tracing::debug!(
                "Ignoring superfluous write_header({}) after {:?}",
                status,
                self.response.status
            );
            return;
        }
        self.response.started = true;
        self.response.status = Some(status);
    }

    /// Append to the response body, starting the response if needed
    pub fn write(&mut self, chunk: impl Into<Bytes>) {
        if !self.response.started {
            let status = self.output.status.unwrap_or(StatusCode::OK);
            self.write_header(status);
        }
        let chunk = chunk.into();
        match &mut self.response.body {
            ResponseBody::Buffered(buf) => buf.extend_from_slice(&chunk),
            body => *body = ResponseBody::Buffered(BytesMut::from(&chunk[..])),
        }
    }

    /// Replace the response body with a stream
    pub fn stream(&mut self, status: StatusCode, body: AxumBody) {
        self.write_header(status);
        self.response.body = ResponseBody::Stream(SyncWrapper::new(body));
    }

    /// Adopt a fully built response (status, headers and body)
    pub fn send_response(&mut self, response: Response<AxumBody>) {
        let (parts, body) = response.into_parts();
        for (name, value) in parts.headers.iter() {
            self.output.headers.append(name.clone(), value.clone());
        }
        self.stream(parts.status, body);
    }

    pub fn text(&mut self, status: StatusCode, body: impl Into<String>) {
        self.output.insert_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.write_header(status);
        self.write(body.into());
    }

    pub fn html(&mut self, status: StatusCode, body: impl Into<String>) {
        self.output.insert_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        self.write_header(status);
        self.write(body.into());
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> ActionResult {
        let body = serde_json::to_vec(value)?;
        self.output.insert_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let status = self.output.status.unwrap_or(StatusCode::OK);
        self.write_header(status);
        self.write(body);
        Ok(())
    }

    pub fn redirect(&mut self, status: StatusCode, location: &str) -> ActionResult {
        let value = HeaderValue::from_str(location)?;
        self.output.insert_header(header::LOCATION, value);
        self.write_header(status);
        Ok(())
    }

    /// Stop the lifecycle and answer with the error page for `status`
    pub fn abort(&mut self, status: StatusCode) -> ActionResult {
        self.output.set_status(status);
        Err(Interrupt::Abort(status))
    }

    pub fn set_cookie(&mut self, cookie: &Cookie<'_>) {
        self.output.cookie(cookie);
    }

    /// Render the view's template (or the default `{controller}/{action}.tpl`) as HTML
    pub fn render(&mut self) -> ActionResult {
        let Some(renderer) = self.services.renderer.clone() else {
            return Err(Interrupt::fault("no template renderer configured"));
        };
        let template = self.view.template_name();
        let mut data = self.view.data.clone();
        data.insert(
            "flash".to_string(),
            serde_json::to_value(&self.view.flash)?,
        );
        if let Some(token) = &self.xsrf_token {
            data.insert("xsrf_token".to_string(), Value::String(token.clone()));
        }
        let data = Value::Object(data);
        let view = View {
            template: &template,
            layout: self.view.layout.as_deref(),
            sections: &self.view.sections,
            data: &data,
        };
        let bytes = renderer.render(&view)?;
        let status = self.output.status.unwrap_or(StatusCode::OK);
        self.output.insert_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        self.write_header(status);
        self.write(bytes);
        Ok(())
    }

    /// CSRF token for this request, issuing the `_xsrf` cookie on first use
    pub fn xsrf_token(&mut self) -> String {
        if let Some(token) = &self.xsrf_token {
            return token.clone();
        }
        let web = &self.services.web;
        let token = match self
            .input
            .cookie(xsrf::XSRF_COOKIE)
            .and_then(|raw| xsrf::verify_secure_value(&web.xsrf_key, &raw))
        {
            Some(token) => token,
            None => {
                let token = xsrf::random_token();
                let cookie = xsrf::secure_cookie(
                    &web.xsrf_key,
                    xsrf::XSRF_COOKIE,
                    &token,
                    web.xsrf_expire,
                );
                self.output.cookie(&cookie);
                token
            }
        };
        self.xsrf_token = Some(token.clone());
        token
    }

    /// Hidden form field carrying the CSRF token
    pub fn xsrf_form_html(&mut self) -> String {
        format!(
            r#"<input type="hidden" name="_xsrf" value="{}" />"#,
            self.xsrf_token()
        )
    }

    /// Verify the submitted token: 422 when missing, 417 when it does not match
    pub fn check_xsrf(&mut self) -> ActionResult {
        let expected = self.xsrf_token();
        let submitted = self
            .input
            .query("_xsrf")
            .or_else(|| self.input.header("x-xsrftoken"))
            .or_else(|| self.input.header("x-csrftoken"))
            .map(str::to_string);
        match submitted {
            None => self.abort(StatusCode::UNPROCESSABLE_ENTITY),
            Some(token) if token.is_empty() => self.abort(StatusCode::UNPROCESSABLE_ENTITY),
            Some(token) if xsrf::tokens_match(&token, &expected) => Ok(()),
            Some(_) => self.abort(StatusCode::EXPECTATION_FAILED),
        }
    }

    // The session helpers clone the handle before awaiting so their futures do not
    // borrow the context, which is not Sync while it holds a streaming body.

    pub fn session_get(&self, key: &str) -> impl Future<Output = Option<Value>> + Send + use<> {
        let session = self.input.session.clone();
        let key = key.to_string();
        async move {
            match session {
                Some(session) => session.get(&key).await,
                None => None,
            }
        }
    }

    pub fn session_set<V: Into<Value>>(
        &self,
        key: &str,
        value: V,
    ) -> impl Future<Output = ActionResult> + Send + use<V> {
        let session = self.require_session();
        let (key, value) = (key.to_string(), value.into());
        async move {
            session?.set(&key, value).await?;
            Ok(())
        }
    }

    pub fn session_delete(&self, key: &str) -> impl Future<Output = ActionResult> + Send + use<> {
        let session = self.require_session();
        let key = key.to_string();
        async move {
            session?.delete(&key).await?;
            Ok(())
        }
    }

    pub fn session_flush(&self) -> impl Future<Output = ActionResult> + Send + use<> {
        let session = self.require_session();
        async move {
            session?.flush().await?;
            Ok(())
        }
    }

    /// Issue a new session identifier, keeping the session's values
    pub async fn regenerate_session(&mut self) -> ActionResult {
        let store = self.session_store()?;
        let session = store
            .regenerate_id(&self.input.headers, &mut self.output.headers)
            .await?;
        self.input.session = Some(session);
        Ok(())
    }

    pub async fn destroy_session(&mut self) -> ActionResult {
        let store = self.session_store()?;
        store
            .destroy(&self.input.headers, &mut self.output.headers)
            .await?;
        self.input.session = None;
        Ok(())
    }

    fn require_session(&self) -> Result<Arc<dyn SessionHandle>, Interrupt> {
        self.input
            .session
            .clone()
            .ok_or_else(|| Interrupt::fault("sessions are not enabled"))
    }

    fn session_store(&self) -> Result<Arc<dyn SessionStore>, Interrupt> {
        self.services
            .sessions
            .clone()
            .ok_or_else(|| Interrupt::fault("sessions are not enabled"))
    }

    /// Build the outgoing response, leaving the context ready for release
    pub fn take_response(&mut self) -> Response<AxumBody> {
        let status = self
            .response
            .status
            .or(self.output.status)
            .unwrap_or(StatusCode::OK);
        let body = match std::mem::take(&mut self.response.body) {
            ResponseBody::Empty => AxumBody::empty(),
            ResponseBody::Buffered(buf) => AxumBody::from(buf.freeze()),
            ResponseBody::Stream(body) => body.into_inner(),
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(&mut self.output.headers);
        response
    }
}
