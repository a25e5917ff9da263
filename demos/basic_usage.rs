//! Basic usage example for svcpool
//!
//! Wires config → connection manager → dispatcher against an in-process echo
//! transport, so it runs without any backend.
//!
//! Run with:
//! ```
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use svcpool::transport::{
    CloseHandler, ErrorHandler, Transport, TransportError, TransportFactory,
};
use svcpool::{Config, ConnectionManager, RequestDispatcher};

/// Answers every request with a success envelope echoing the payload.
#[derive(Debug)]
struct EchoTransport;

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&self, pattern: &str, payload: Value) -> Result<Value, TransportError> {
        Ok(json!({"success": true, "data": {"pattern": pattern, "echo": payload}}))
    }

    async fn emit(&self, _pattern: &str, _payload: Value) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn on_error(&self, _handler: ErrorHandler) {}

    fn on_close(&self, _handler: CloseHandler) {}
}

struct EchoFactory;

#[async_trait]
impl TransportFactory for EchoFactory {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(EchoTransport))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::new();
    config.default_service = Some("echo-service".to_string());

    let manager = ConnectionManager::new(config, Arc::new(EchoFactory));
    let dispatcher = RequestDispatcher::new(manager.clone());

    println!("svcpool - Basic Usage Example");
    println!("=============================\n");

    // Example 1: request/reply
    println!("1. Sending a request...");
    let reply = dispatcher
        .send_request("greet", json!({"name": "world"}), Default::default())
        .await?;
    println!("   Reply: {}\n", reply);

    // Example 2: fire-and-forget
    println!("2. Emitting an event...");
    dispatcher
        .emit("user_updated", json!({"id": 7}), Default::default())
        .await;
    println!("   Emitted (no reply expected)\n");

    // Example 3: health and status
    println!("3. Checking health...");
    let healthy = dispatcher.check_health(None).await;
    println!("   Healthy: {}", healthy);
    for (name, status) in manager.all_statuses().await {
        println!("   {}: {:?} (attempts: {})", name, status.state, status.attempts);
    }

    // Example 4: latency probe
    println!("\n4. Probing latency...");
    let report = manager.test_connection(None).await;
    println!("   Success: {}, latency: {:?}", report.success, report.latency);

    manager.shutdown().await;
    println!("\nAll operations completed successfully!");

    Ok(())
}
