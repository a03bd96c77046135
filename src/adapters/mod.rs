pub mod access_log;
pub mod file_system;
pub mod http_handler;
pub mod session;

/// Re-export commonly used types from adapters
pub use access_log::TracingAccessLogger;
pub use file_system::FileSystemAdapter;
pub use http_handler::{HttpHandler, serve};
pub use session::MemorySessionStore;
