//! lfcc-server library: exposes the daemon components for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to run a real server in-process.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod scheduler;
pub mod server;
pub mod store;

// Re-export key types for convenience
pub use config::{Args, ServerConfig};
pub use connection::{ClientConnection, ConnectionEvent};
pub use daemon::Daemon;
pub use scheduler::CompactionScheduler;
pub use server::WebSocketServer;
pub use store::FileStore;
