pub mod access_log;
pub mod file_system;
pub mod session;
pub mod template;
