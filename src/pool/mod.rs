//! Connection management module
//!
//! This module provides:
//! - Per-service connection table with lazy, deduplicated dialing
//! - Reconnect with exponential backoff and health probing
//! - Idle eviction and operational introspection

pub mod manager;

pub use manager::{
    ConnectError, ConnectionManager, ConnectionState, ConnectionTest, ServiceStatus,
    HEALTH_CHECK_PATTERN,
};
