//! Trellis - the request-dispatch core of a server-side web framework.
//!
//! Trellis receives an HTTP request, serves it from the static asset cache when it names a
//! file under a configured prefix, and otherwise matches it against an ordered route table,
//! runs a request-scoped controller through a fixed lifecycle, and turns every failure into
//! an error page. Request contexts are pooled and fully reset between requests.
//!
//! # Features
//! - First-match-wins routing on host, path, query and method, with `{name:regex}`
//!   variables and subrouters that inherit a copy of their parent's predicates
//! - Controllers with fixed verb slots, per-route action tables and method mappings
//! - Body admission limits (413), CSRF verification (422 / 417) and flash messages
//! - An LRU static asset cache with gzip variants, conditional and range requests
//! - Failure containment: aborts run the registered error page, faults and panics are
//!   logged with a backtrace and never take the server down
//! - Pluggable ports for templates, sessions, access logs and the file system
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use hyper::StatusCode;
//! use trellis::{
//!     ActionResult, AppConfig, Controller, GracefulShutdown, HttpHandler, Multiplexer,
//!     RequestContext, Router,
//! };
//!
//! #[derive(Clone, Default)]
//! struct Hello;
//!
//! #[async_trait]
//! impl Controller for Hello {
//!     async fn get(&mut self, ctx: &mut RequestContext) -> ActionResult {
//!         let name = ctx.input.param("name").unwrap_or("world").to_string();
//!         ctx.text(StatusCode::OK, format!("hello {name}"));
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let mut router = Router::new();
//! router.handle("/hello/{name:[a-z]+}", Hello)?;
//!
//! let mux = Multiplexer::builder(AppConfig::default()).router(router).build();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7000").await?;
//! trellis::serve(listener, HttpHandler::new(Arc::new(mux)), GracefulShutdown::new()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Ports (traits) live in `ports`, their reference implementations in `adapters`, and the
//! dispatch logic in `core`. Nothing is process-global: a [`Multiplexer`] owns its route
//! table, context pool, static cache and error pages, so several can run side by side.
//!
//! # Error Handling
//! Setup APIs return `eyre::Result<T>` or a domain error type (`RouteError`,
//! `ValidationError`). Controller steps return [`ActionResult`]; any `std::error::Error`
//! converts into a fault with `?`.
//!
//! # Concurrency & Data Structures
//! Shared mutable collections use `scc` (`scc::Bag` for idle contexts, `scc::HashMap`
//! for sessions). The static cache sits behind a `std::sync::RwLock` that is never held
//! across an `.await`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate and embedders
pub use crate::{
    adapters::{FileSystemAdapter, HttpHandler, MemorySessionStore, TracingAccessLogger, serve},
    config::models::AppConfig,
    core::{
        ActionResult, Controller, Handler, Interrupt, Multiplexer, RequestContext, Route,
        RouteError, Router, abort,
    },
    utils::{GracefulShutdown, ShutdownReason},
};
