//! The request dispatcher.
//!
//! [`Multiplexer`] owns everything one application needs to answer requests: the route
//! table, the context pool, the static file service, the error-page registry and the
//! ports for sessions, templates and access logs. Several multiplexers can live in one
//! process; nothing here is global.
//!
//! Every request follows the same path:
//!
//! ```text
//! acquire context → static files → body admission → route → controller lifecycle
//!                        │               │            │            │
//!                        └───────────────┴────────────┴────────────┴→ Interrupt → error page
//! → response → access log → release context
//! ```
use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, Once},
    time::Instant,
};

use axum::body::Body as AxumBody;
use chrono::Utc;
use futures_util::FutureExt;
use hyper::{
    Method, Request, Response, StatusCode,
    header::{self, HeaderValue},
};

use crate::{
    adapters::file_system::FileSystemAdapter,
    config::models::{AppConfig, EnvMode},
    core::{
        body::{BodyLimits, admit_body},
        context::{ContextServices, RequestContext},
        controller::{ActionResult, ErasedController, Fault, Interrupt},
        errors::{ErrorHandlers, fault_page},
        pool::{ContextPool, PoolStats},
        router::{MatchOutcome, Router},
        static_files::{StaticFiles, StaticOutcome},
    },
    ports::{
        access_log::{AccessLogRecord, AccessLogger},
        file_system::FileSystem,
        session::SessionStore,
        template::TemplateRenderer,
    },
};

/// Builder for [`Multiplexer`]
pub struct MultiplexerBuilder<F: FileSystem = FileSystemAdapter> {
    config: AppConfig,
    router: Router,
    file_system: Arc<F>,
    renderer: Option<Arc<dyn TemplateRenderer>>,
    sessions: Option<Arc<dyn SessionStore>>,
    access_logger: Option<Arc<dyn AccessLogger>>,
    error_handlers: ErrorHandlers,
}

impl MultiplexerBuilder<FileSystemAdapter> {
    fn new(config: AppConfig) -> Self {
        let error_handlers = ErrorHandlers::with_defaults(config.env_mode);
        Self {
            config,
            router: Router::new(),
            file_system: Arc::new(FileSystemAdapter::new()),
            renderer: None,
            sessions: None,
            access_logger: None,
            error_handlers,
        }
    }
}

impl<F: FileSystem> MultiplexerBuilder<F> {
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Serve static assets through a different file system
    pub fn file_system<G: FileSystem>(self, file_system: Arc<G>) -> MultiplexerBuilder<G> {
        MultiplexerBuilder {
            config: self.config,
            router: self.router,
            file_system,
            renderer: self.renderer,
            sessions: self.sessions,
            access_logger: self.access_logger,
            error_handlers: self.error_handlers,
        }
    }

    pub fn renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Session store started for every routed request
    pub fn sessions(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn access_logger(mut self, logger: Arc<dyn AccessLogger>) -> Self {
        self.access_logger = Some(logger);
        self
    }

    /// Replace the error page for `status`
    pub fn error_handler<H>(mut self, status: StatusCode, handler: H) -> Self
    where
        H: Fn(&mut RequestContext, StatusCode) + Send + Sync + 'static,
    {
        self.error_handlers.register(status, handler);
        self
    }

    /// Replace the whole error-page registry
    pub fn error_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.error_handlers = handlers;
        self
    }

    pub fn build(self) -> Multiplexer<F> {
        install_panic_hook();
        let services = Arc::new(ContextServices {
            web: self.config.web.clone(),
            env_mode: self.config.env_mode,
            renderer: self.renderer,
            sessions: self.sessions,
        });
        let body_limits = BodyLimits {
            copy_request_body: self.config.copy_request_body,
            max_memory: self.config.max_memory,
            max_upload_size: self.config.max_upload_size,
        };
        Multiplexer {
            pool: ContextPool::new(self.config.pool.max_idle, services),
            static_files: StaticFiles::new(self.config.static_files.clone(), self.file_system),
            router: Arc::new(self.router),
            error_handlers: self.error_handlers,
            access_logger: self.access_logger,
            body_limits,
            config: Arc::new(self.config),
        }
    }
}

pub struct Multiplexer<F: FileSystem = FileSystemAdapter> {
    config: Arc<AppConfig>,
    router: Arc<Router>,
    pool: ContextPool,
    static_files: StaticFiles<F>,
    error_handlers: ErrorHandlers,
    access_logger: Option<Arc<dyn AccessLogger>>,
    body_limits: BodyLimits,
}

impl Multiplexer<FileSystemAdapter> {
    pub fn builder(config: AppConfig) -> MultiplexerBuilder<FileSystemAdapter> {
        MultiplexerBuilder::new(config)
    }
}

impl<F: FileSystem> Multiplexer<F> {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn static_files(&self) -> &StaticFiles<F> {
        &self.static_files
    }

    pub fn error_handlers(&self) -> &ErrorHandlers {
        &self.error_handlers
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Answer one request. Every failure is turned into a response here.
    pub async fn serve_http(
        &self,
        req: Request<AxumBody>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let start = Instant::now();
        let request_time = Utc::now();
        let (parts, body) = req.into_parts();
        let mut ctx = self.pool.acquire(parts, remote_addr);

        let outcome = AssertUnwindSafe(self.dispatch(&mut ctx, body))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(interrupt)) => self.contain(&mut ctx, interrupt),
            Err(payload) => {
                let message = format!("panic: {}", panic_message(payload.as_ref()));
                let fault = match take_panic_trace() {
                    Some(trace) => Fault::with_backtrace(message, trace),
                    None => Fault::new(message),
                };
                self.contain(&mut ctx, Interrupt::Fault(fault));
            }
        }

        let buffered = ctx.response.bytes_buffered();
        let response = ctx.take_response();
        let elapsed = start.elapsed();

        let body_bytes_sent = if buffered > 0 {
            buffered
        } else {
            response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        if self.should_log_access(ctx.input.path()) {
            if let Some(logger) = &self.access_logger {
                logger.record(&access_record(
                    &ctx,
                    response.status(),
                    request_time,
                    elapsed,
                    body_bytes_sent,
                ));
            }
        }

        tracing::debug!(
            method = %ctx.input.method(),
            path = %ctx.input.path(),
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Request finished"
        );

        ctx.release();
        response
    }

    fn should_log_access(&self, path: &str) -> bool {
        let log = &self.config.log;
        log.access_logs && (log.enable_static_logs || !self.static_files.is_static_path(path))
    }

    async fn dispatch(&self, ctx: &mut RequestContext, body: AxumBody) -> ActionResult {
        match self.static_files.serve(ctx).await {
            StaticOutcome::Served => return Ok(()),
            StaticOutcome::Abort(status) => return Err(Interrupt::Abort(status)),
            StaticOutcome::NotStatic => {}
        }

        if let Err(e) = admit_body(ctx, body, self.body_limits).await {
            tracing::warn!(
                method = %ctx.input.method(),
                path = %ctx.input.path(),
                "Rejecting request body: {}",
                e
            );
            return Err(Interrupt::Abort(e.status()));
        }

        let method = ctx.input.method().clone();
        let (controller, action) =
            match self
                .router
                .match_request(&method, ctx.input.uri(), ctx.input.headers())
            {
                MatchOutcome::Matched(found) => {
                    let action = found.action_for(&method);
                    let controller = found.controller.clone();
                    for (name, value) in found.vars {
                        ctx.input.set_param(name, value);
                    }
                    (controller, action)
                }
                MatchOutcome::MethodMismatch { allowed } => {
                    tracing::debug!(
                        method = %method,
                        path = %ctx.input.path(),
                        ?allowed,
                        "Route matched but method did not"
                    );
                    // Reported as 404 unless `router.method_not_allowed` opts into 405
                    if !self.config.router.method_not_allowed {
                        return Err(Interrupt::Abort(StatusCode::NOT_FOUND));
                    }
                    let allow = allowed
                        .iter()
                        .map(Method::as_str)
                        .collect::<Vec<_>>()
                        .join(", ");
                    if let Ok(value) = HeaderValue::from_str(&allow) {
                        ctx.output.insert_header(header::ALLOW, value);
                    }
                    return Err(Interrupt::Abort(StatusCode::METHOD_NOT_ALLOWED));
                }
                MatchOutcome::NotFound => return Err(Interrupt::Abort(StatusCode::NOT_FOUND)),
            };

        if ctx.response.started() {
            return Ok(());
        }
        self.run_controller(ctx, controller, action).await
    }

    async fn run_controller(
        &self,
        ctx: &mut RequestContext,
        prototype: Arc<dyn ErasedController>,
        action: String,
    ) -> ActionResult {
        let mut controller = prototype.instantiate();

        if let Some(store) = self.pool.services().sessions.clone() {
            match store
                .start(ctx.input.headers(), ctx.output.headers_mut())
                .await
            {
                Ok(session) => ctx.input.session = Some(session),
                Err(e) => {
                    tracing::error!("Failed to start session: {}", e);
                    return Err(Interrupt::Abort(StatusCode::SERVICE_UNAVAILABLE));
                }
            }
        }

        ctx.view.controller_name = controller.name();
        ctx.view.action_name = action.clone();

        controller.before_action(ctx).await?;
        ctx.read_flash_data();

        if self.config.web.enable_xsrf && controller.xsrf_enabled() {
            ctx.xsrf_token();
            let method = ctx.input.method();
            if method == Method::POST || method == Method::PUT || method == Method::DELETE {
                ctx.check_xsrf()?;
            }
        }

        // A hook that already answered skips the action; after_action still runs
        let outcome = if ctx.response.started() {
            Ok(())
        } else {
            match controller.dispatch(&action, ctx).await {
                Ok(()) => self.render_default(ctx),
                Err(interrupt) => Err(interrupt),
            }
        };
        match outcome {
            Err(Interrupt::Fault(fault)) => Err(Interrupt::Fault(fault)),
            outcome => {
                let after = controller.after_action(ctx).await;
                outcome.and(after)
            }
        }
    }

    /// Render `{controller}/{action}.tpl` when the action wrote nothing
    fn render_default(&self, ctx: &mut RequestContext) -> ActionResult {
        if ctx.response.started()
            || ctx.output.status().is_some()
            || ctx.services().renderer.is_none()
        {
            return Ok(());
        }
        ctx.render()
    }

    /// Turn an interrupt into the response the client sees
    fn contain(&self, ctx: &mut RequestContext, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Abort(status) => {
                if ctx.response.started() {
                    tracing::debug!(
                        "Abort with {} after the response started; keeping the response",
                        status
                    );
                    return;
                }
                self.error_handlers.exception(status, ctx);
            }
            Interrupt::Fault(fault) => {
                tracing::error!(
                    method = %ctx.input.method(),
                    path = %ctx.input.path(),
                    error = %fault.message,
                    "Handler fault\n{}",
                    fault.backtrace
                );
                if ctx.response.started() {
                    return;
                }
                let status = ctx
                    .output
                    .status()
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                match self.config.env_mode {
                    EnvMode::Development => {
                        let page = fault_page(&self.config.app_name, ctx, &fault);
                        ctx.html(status, page);
                    }
                    EnvMode::Production => self.error_handlers.exception(status, ctx),
                }
            }
        }
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records where the panic started. `catch_unwind` runs on the
/// panicking thread, so the trace is picked up from the same thread-local.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown location".to_string());
            let trace = format!("panicked at {location}\n{}", Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn access_record(
    ctx: &RequestContext,
    status: StatusCode,
    request_time: chrono::DateTime<Utc>,
    elapsed: std::time::Duration,
    body_bytes_sent: u64,
) -> AccessLogRecord {
    let input = &ctx.input;
    let protocol = format!("{:?}", input.version());
    let uri = input
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| input.path().to_string());
    AccessLogRecord {
        remote_addr: input.ip(),
        request_time,
        method: input.method().to_string(),
        request: format!("{} {} {}", input.method(), uri, protocol),
        protocol,
        host: input.host().to_string(),
        status: status.as_u16(),
        elapsed,
        referer: input.referer().to_string(),
        user_agent: input.user_agent().to_string(),
        remote_user: input.header("remote-user").unwrap_or_default().to_string(),
        body_bytes_sent,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;
    use crate::core::controller::Controller;

    #[derive(Clone, Default)]
    struct Hello;

    #[async_trait]
    impl Controller for Hello {
        async fn get(&mut self, ctx: &mut RequestContext) -> ActionResult {
            let name = ctx.input.param("name").unwrap_or("world").to_string();
            ctx.text(StatusCode::OK, format!("hello {name}"));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Ticker;

    #[async_trait]
    impl Controller for Ticker {
        async fn get(&mut self, ctx: &mut RequestContext) -> ActionResult {
            ctx.stream(StatusCode::OK, AxumBody::from("tick"));
            Ok(())
        }

        async fn post(&mut self, _ctx: &mut RequestContext) -> ActionResult {
            panic!("ticker jammed");
        }
    }

    fn multiplexer() -> Multiplexer {
        let mut router = Router::new();
        router.handle("/hello/{name}", Hello).unwrap();
        router.handle("/tick", Ticker).unwrap();
        Multiplexer::builder(AppConfig::builder().static_dirs(vec![]).build())
            .router(router)
            .build()
    }

    async fn body_text(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_routed_request() {
        let mux = multiplexer();
        let req = Request::get("/hello/ana").body(AxumBody::empty()).unwrap();
        let response = mux.serve_http(req, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello ana");
        assert_eq!(mux.pool_stats().idle, 1);
    }

    #[tokio::test]
    async fn test_unrouted_request_is_404() {
        let mux = multiplexer();
        let req = Request::get("/nope").body(AxumBody::empty()).unwrap();
        let response = mux.serve_http(req, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_multiplexer_is_send_sync() {
        assert_send_sync::<RequestContext>();
        assert_send_sync::<ContextPool>();
        assert_send_sync::<Multiplexer>();
        assert_send_sync::<Arc<Multiplexer>>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_requests_share_one_multiplexer() {
        let mux = Arc::new(multiplexer());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let mux = mux.clone();
            tasks.push(tokio::spawn(async move {
                let uri = if i % 2 == 0 { "/tick" } else { "/hello/ana" };
                let req = Request::get(uri).body(AxumBody::empty()).unwrap();
                body_text(mux.serve_http(req, None).await).await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let expected = if i % 2 == 0 { "tick" } else { "hello ana" };
            assert_eq!(task.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_panic_trace_starts_at_the_panic() {
        let mux = multiplexer();
        let req = Request::post("/tick").body(AxumBody::empty()).unwrap();
        let response = mux.serve_http(req, None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let page = body_text(response).await;
        assert!(page.contains("ticker jammed"));
        assert!(page.contains(&format!("panicked at {}:", file!())));
        assert!(take_panic_trace().is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
