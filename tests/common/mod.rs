//! Scriptable in-memory transport for integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use svcpool::config::Config;
use svcpool::transport::{
    CloseHandler, ErrorHandler, Transport, TransportError, TransportFactory,
};

pub type ReplyFn = dyn Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync;

/// One scripted connection. Replies come from the factory's reply function;
/// sends, emits and closes are counted for assertions.
pub struct MockTransport {
    reply: Arc<ReplyFn>,
    reply_delay: Duration,
    sends: AtomicUsize,
    closes: AtomicUsize,
    pub emits: Mutex<Vec<(String, Value)>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("sends", &self.sends.load(Ordering::SeqCst))
            .field("closes", &self.closes.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Fire registered close handlers, as a peer hangup would.
    pub fn trigger_close(&self) {
        for handler in self.close_handlers.lock().unwrap().iter() {
            handler();
        }
    }

    /// Fire registered error handlers.
    pub fn trigger_error(&self, err: TransportError) {
        for handler in self.error_handlers.lock().unwrap().iter() {
            handler(err.clone());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, pattern: &str, payload: Value) -> Result<Value, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.reply_delay > Duration::ZERO {
            tokio::time::sleep(self.reply_delay).await;
        }
        (self.reply)(pattern, &payload)
    }

    async fn emit(&self, pattern: &str, payload: Value) -> Result<(), TransportError> {
        self.emits.lock().unwrap().push((pattern.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.error_handlers.lock().unwrap().push(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.close_handlers.lock().unwrap().push(handler);
    }
}

/// Factory producing [`MockTransport`] connections. Dial failures and delays
/// are scriptable; every produced transport is retained for inspection.
pub struct MockFactory {
    pub dials: AtomicUsize,
    pub fail_dials: AtomicBool,
    pub dial_delay: Duration,
    pub reply_delay: Duration,
    reply: Arc<ReplyFn>,
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn with_reply(
        reply: impl Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            dials: AtomicUsize::new(0),
            fail_dials: AtomicBool::new(false),
            dial_delay: Duration::ZERO,
            reply_delay: Duration::ZERO,
            reply: Arc::new(reply),
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Factory whose transports answer every send with a success envelope.
    pub fn ok() -> Self {
        Self::with_reply(|_, _| Ok(json!({"success": true, "data": "pong"})))
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock().unwrap()[index])
    }

    pub fn total_sends(&self) -> usize {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.send_count())
            .sum()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Arc<dyn Transport>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.dial_delay > Duration::ZERO {
            tokio::time::sleep(self.dial_delay).await;
        }
        if self.fail_dials.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("mock dial refused".to_string()));
        }

        let transport = Arc::new(MockTransport {
            reply: Arc::clone(&self.reply),
            reply_delay: self.reply_delay,
            sends: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            emits: Mutex::new(Vec::new()),
            close_handlers: Mutex::new(Vec::new()),
            error_handlers: Mutex::new(Vec::new()),
        });
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Fresh config with `service` as the default target. Service names resolve
/// through built-in defaults; the mock factory ignores host and port anyway.
pub fn test_config(service: &str) -> Config {
    let mut config = Config::new();
    config.default_service = Some(service.to_string());
    config
}
