//! Controllers and the request lifecycle outcome type.
//!
//! A controller is registered once as a *prototype*; every request that matches its route
//! gets a fresh clone, so controller fields are request-local. Routes hold prototypes
//! behind the object-safe [`ErasedController`] so controllers of different types can live
//! in one route table.
//!
//! ```text
//! router.handle("/users/{id}", UserController::default())
//!        ↓ Handler<UserController>            (prototype + action table)
//! Arc<dyn ErasedController>                   ← stored on the Route
//!        ↓ instantiate() per request
//! Box<dyn ControllerInstance>                 ← clone of the prototype
//!        ↓ dispatch("GET" | action name)
//! UserController::get / action table / call_named
//! ```
//!
//! Every lifecycle step returns an [`ActionResult`]. `Err(Interrupt::Abort(status))` stops
//! the lifecycle and answers with the registered page for `status`;
//! `Err(Interrupt::Fault(..))` is treated as a handler crash. Any `std::error::Error`
//! converts into a fault, so `?` works inside actions.
use std::{any::type_name, backtrace::Backtrace, collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use hyper::{StatusCode, header};

use crate::core::context::RequestContext;

/// Outcome of one lifecycle step
pub type ActionResult = Result<(), Interrupt>;

/// Why a lifecycle step stopped the request
#[derive(Debug)]
pub enum Interrupt {
    /// Stop and answer with the error page registered for this status
    Abort(StatusCode),
    /// Unexpected failure, logged with a stack trace
    Fault(Fault),
}

/// Detail recorded for a handler crash
#[derive(Debug, Clone)]
pub struct Fault {
    pub message: String,
    pub backtrace: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    /// A fault whose trace was captured elsewhere, e.g. where a panic started
    pub fn with_backtrace(message: impl Into<String>, backtrace: String) -> Self {
        Self {
            message: message.into(),
            backtrace,
        }
    }
}

impl Interrupt {
    pub fn abort(status: StatusCode) -> Self {
        Interrupt::Abort(status)
    }

    pub fn fault(message: impl fmt::Display) -> Self {
        Interrupt::Fault(Fault::new(message.to_string()))
    }

    /// Convert an eyre report, keeping its context chain in the message
    pub fn from_report(report: eyre::Report) -> Self {
        Interrupt::Fault(Fault::new(format!("{report:#}")))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Interrupt::Abort(status) => Some(*status),
            Interrupt::Fault(_) => None,
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Abort(status) => write!(f, "aborted with status {status}"),
            Interrupt::Fault(fault) => write!(f, "handler fault: {}", fault.message),
        }
    }
}

// Interrupt must not implement std::error::Error or this impl conflicts with `From<T> for T`.
impl<E> From<E> for Interrupt
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(&format!(": {cause}"));
            source = cause.source();
        }
        Interrupt::Fault(Fault::new(message))
    }
}

/// Shorthand for `Err(Interrupt::Abort(status))`
pub fn abort<T>(status: StatusCode) -> Result<T, Interrupt> {
    Err(Interrupt::Abort(status))
}

/// Request handler with fixed slots for the standard HTTP verbs.
///
/// Verb slots that are not overridden answer `405 Method Not Allowed`, except `trace`
/// which echoes the request.
#[async_trait]
pub trait Controller: Clone + Send + Sync + 'static {
    /// Name used for the default template path, e.g. `user` for `UserController`
    fn name(&self) -> String {
        default_controller_name::<Self>()
    }

    /// Action names reachable through [`Controller::call_named`]; method mappings may
    /// only name these or entries of the handler's action table
    fn actions() -> &'static [&'static str] {
        &[]
    }

    /// Whether CSRF verification applies to this controller
    fn xsrf_enabled(&self) -> bool {
        true
    }

    async fn before_action(&mut self, _ctx: &mut RequestContext) -> ActionResult {
        Ok(())
    }

    async fn get(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn post(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn put(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn delete(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn head(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn patch(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn options(&mut self, ctx: &mut RequestContext) -> ActionResult {
        method_not_allowed(ctx)
    }

    async fn trace(&mut self, ctx: &mut RequestContext) -> ActionResult {
        trace_echo(ctx)
    }

    /// Run an action by name; `None` when this controller has no such action
    async fn call_named(
        &mut self,
        _name: &str,
        _ctx: &mut RequestContext,
    ) -> Option<ActionResult> {
        None
    }

    async fn after_action(&mut self, _ctx: &mut RequestContext) -> ActionResult {
        Ok(())
    }
}

/// `FooController` -> `foo`
fn default_controller_name<C>() -> String {
    let full = type_name::<C>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    short
        .strip_suffix("Controller")
        .filter(|s| !s.is_empty())
        .unwrap_or(short)
        .to_lowercase()
}

fn method_not_allowed(ctx: &mut RequestContext) -> ActionResult {
    ctx.text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    Ok(())
}

/// Loop the request line and headers back as `message/http`
fn trace_echo(ctx: &mut RequestContext) -> ActionResult {
    let mut echo = format!(
        "\r\nTRACE {} {:?}",
        ctx.input.uri(),
        ctx.input.version()
    );
    for (name, value) in ctx.input.headers() {
        echo.push_str(&format!(
            "\r\n{}: {}",
            name,
            String::from_utf8_lossy(value.as_bytes())
        ));
    }
    echo.push_str("\r\n");

    let headers = ctx.output.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("message/http"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    ctx.write_header(StatusCode::OK);
    ctx.write(echo);
    Ok(())
}

/// A named action: an async function over the controller and the request context
pub type ActionFn<C> = Arc<
    dyn for<'a> Fn(&'a mut C, &'a mut RequestContext) -> BoxFuture<'a, ActionResult>
        + Send
        + Sync,
>;

/// A controller prototype plus the action table registered with it
pub struct Handler<C: Controller> {
    prototype: C,
    actions: HashMap<String, ActionFn<C>>,
}

impl<C: Controller> Handler<C> {
    pub fn new(prototype: C) -> Self {
        Self {
            prototype,
            actions: HashMap::new(),
        }
    }

    /// Register a named action, reachable through a method mapping or a non-standard verb
    pub fn action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, &'a mut RequestContext) -> BoxFuture<'a, ActionResult>
            + Send
            + Sync
            + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub(crate) fn into_erased(self) -> Arc<dyn ErasedController> {
        Arc::new(Prototype {
            prototype: self.prototype,
            actions: Arc::new(self.actions),
        })
    }
}

/// Anything a route can be bound to: a bare controller or a [`Handler`] with actions
pub trait IntoHandler {
    type Controller: Controller;

    fn into_handler(self) -> Handler<Self::Controller>;
}

impl<C: Controller> IntoHandler for C {
    type Controller = C;

    fn into_handler(self) -> Handler<C> {
        Handler::new(self)
    }
}

impl<C: Controller> IntoHandler for Handler<C> {
    type Controller = C;

    fn into_handler(self) -> Handler<C> {
        self
    }
}

/// Object-safe view of a registered prototype
pub trait ErasedController: Send + Sync {
    fn name(&self) -> String;

    /// Whether `name` resolves to an action table entry or a declared controller action
    fn has_action(&self, name: &str) -> bool;

    /// Clone the prototype into a request-local instance
    fn instantiate(&self) -> Box<dyn ControllerInstance>;
}

/// A live controller for exactly one request
#[async_trait]
pub trait ControllerInstance: Send {
    fn name(&self) -> String;

    fn xsrf_enabled(&self) -> bool;

    async fn before_action(&mut self, ctx: &mut RequestContext) -> ActionResult;

    /// Run the action for an HTTP verb (upper case) or an action name
    async fn dispatch(&mut self, action: &str, ctx: &mut RequestContext) -> ActionResult;

    async fn after_action(&mut self, ctx: &mut RequestContext) -> ActionResult;
}

struct Prototype<C: Controller> {
    prototype: C,
    actions: Arc<HashMap<String, ActionFn<C>>>,
}

impl<C: Controller> ErasedController for Prototype<C> {
    fn name(&self) -> String {
        self.prototype.name()
    }

    fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name) || C::actions().contains(&name)
    }

    fn instantiate(&self) -> Box<dyn ControllerInstance> {
        Box::new(Instance {
            controller: self.prototype.clone(),
            actions: self.actions.clone(),
        })
    }
}

struct Instance<C: Controller> {
    controller: C,
    actions: Arc<HashMap<String, ActionFn<C>>>,
}

#[async_trait]
impl<C: Controller> ControllerInstance for Instance<C> {
    fn name(&self) -> String {
        self.controller.name()
    }

    fn xsrf_enabled(&self) -> bool {
        self.controller.xsrf_enabled()
    }

    async fn before_action(&mut self, ctx: &mut RequestContext) -> ActionResult {
        self.controller.before_action(ctx).await
    }

    async fn dispatch(&mut self, action: &str, ctx: &mut RequestContext) -> ActionResult {
        match action {
            "GET" => self.controller.get(ctx).await,
            "POST" => self.controller.post(ctx).await,
            "PUT" => self.controller.put(ctx).await,
            "DELETE" => self.controller.delete(ctx).await,
            "HEAD" => self.controller.head(ctx).await,
            "PATCH" => self.controller.patch(ctx).await,
            "OPTIONS" => self.controller.options(ctx).await,
            "TRACE" => self.controller.trace(ctx).await,
            name => {
                if let Some(action_fn) = self.actions.get(name) {
                    return action_fn(&mut self.controller, ctx).await;
                }
                match self.controller.call_named(name, ctx).await {
                    Some(result) => result,
                    None => {
                        tracing::debug!(
                            controller = %self.controller.name(),
                            action = name,
                            "No action registered for verb or name"
                        );
                        method_not_allowed(ctx)
                    }
                }
            }
        }
    }

    async fn after_action(&mut self, ctx: &mut RequestContext) -> ActionResult {
        self.controller.after_action(ctx).await
    }
}
