pub mod body;
pub mod content;
pub mod context;
pub mod controller;
pub mod errors;
pub mod flash;
pub mod multiplexer;
pub mod pool;
pub mod route_regexp;
pub mod router;
pub mod static_cache;
pub mod static_files;
pub mod xsrf;

pub use context::RequestContext;
pub use controller::{ActionResult, Controller, Handler, Interrupt, abort};
pub use multiplexer::{Multiplexer, MultiplexerBuilder};
pub use pool::{ContextPool, PooledContext};
pub use router::{Route, RouteError, Router};
