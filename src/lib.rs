//! svcpool - resilient per-service connection pooling and request dispatch

pub mod config;
pub mod dispatch;
pub mod pool;
pub mod transport;

pub use config::Config;
pub use dispatch::RequestDispatcher;
pub use pool::ConnectionManager;
