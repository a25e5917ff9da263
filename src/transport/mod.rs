//! Transport contract for backend services
//!
//! The crate never opens sockets itself. Callers supply a [`TransportFactory`]
//! that dials a (host, port) pair and returns a connected [`Transport`]
//! handle; the connection manager owns the handle's lifecycle from there.
//! Replies are arbitrary JSON values classified once, at this boundary, into
//! raw payloads vs success/error envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Callback invoked when the transport detects an unrecoverable error.
pub type ErrorHandler = Box<dyn Fn(TransportError) + Send + Sync>;

/// Callback invoked when the transport observes the peer closing.
pub type CloseHandler = Box<dyn Fn() + Send + Sync>;

/// Error types raised by transport implementations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("connection closed")]
    Closed,

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("transport failure: {0}")]
    Other(String),
}

/// One open connection to a backend service.
///
/// `send` is request/reply; `emit` is fire-and-forget. Implementations must
/// support handler registration for error/close notifications so the
/// connection manager can observe transport-level failures without polling.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a request and wait for the reply value.
    async fn send(&self, pattern: &str, payload: Value) -> Result<Value, TransportError>;

    /// Send without waiting for a reply.
    async fn emit(&self, pattern: &str, payload: Value) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;

    /// Register a handler for transport-level errors.
    fn on_error(&self, handler: ErrorHandler);

    /// Register a handler for peer-initiated close.
    fn on_close(&self, handler: CloseHandler);
}

/// Produces connected [`Transport`] handles for (host, port) pairs.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Structured reply wrapper used by backends that report success explicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub message: Option<String>,
}

/// A transport reply, classified once at the boundary.
///
/// Objects carrying a `success` field are envelopes; other objects are raw
/// domain values returned to the caller unchanged.
#[derive(Debug, Clone)]
pub enum Reply {
    Raw(Value),
    Envelope(Envelope),
}

impl Reply {
    /// Classify a reply value. Returns `None` for values no backend should
    /// produce: non-objects, or envelopes with a malformed `success` field.
    pub fn classify(value: Value) -> Option<Reply> {
        let is_envelope = matches!(&value, Value::Object(map) if map.contains_key("success"));
        if is_envelope {
            serde_json::from_value(value).ok().map(Reply::Envelope)
        } else if value.is_object() {
            Some(Reply::Raw(value))
        } else {
            None
        }
    }
}
