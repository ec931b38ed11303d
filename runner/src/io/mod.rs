//! I/O for runner commands: configuration, hooks, processes, backends, sessions.

pub mod backend;
pub mod config;
pub mod hooks;
pub mod init;
pub mod process;
pub mod session_store;
