//! Per-service connection lifecycle management
//!
//! This module provides:
//! - Lazy, deduplicated dialing (one in-flight connect per service name)
//! - Reconnect with exponential backoff, cancellable on entry removal
//! - Periodic health probes per connection
//! - Idle eviction and parallel shutdown
//! - Operational status, force-reconnect, latency probe and warmup surfaces

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServiceConfig};
use crate::transport::{Transport, TransportError, TransportFactory};

/// Pattern every backend answers as a liveness probe
pub const HEALTH_CHECK_PATTERN: &str = "health_check";

/// Timeout for the `test_connection` round trip
const TEST_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection manager error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to '{service}' after {attempts} attempts")]
    ConnectFailed { service: String, attempts: u32 },

    #[error("timed out connecting to '{service}'")]
    ConnectTimeout { service: String },

    #[error("host not found for '{service}'")]
    HostNotFound { service: String },

    #[error("transport error dialing '{service}': {message}")]
    Transport { service: String, message: String },
}

/// Lifecycle state of a service connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A dial is in flight; callers queue as waiters
    Connecting,
    /// The handle is live and observable by dispatch
    Connected,
    /// The handle is unusable; the next caller triggers a fresh dial
    Disconnected,
}

/// Point-in-time snapshot of one service entry
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    /// Time since the connection was last handed to a caller
    pub idle_for: Duration,
}

/// Outcome of a `test_connection` round trip
#[derive(Debug, Clone)]
pub struct ConnectionTest {
    pub success: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

type Waiter = oneshot::Sender<Result<Arc<dyn Transport>, ConnectError>>;

/// One table entry per service name.
///
/// All mutation happens under the manager's table lock; dispatch only ever
/// borrows the handle, and only once the state is Connected.
struct ServiceEntry {
    handle: Option<Arc<dyn Transport>>,
    state: ConnectionState,
    attempts: u32,
    last_used: Instant,
    health_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    waiters: Vec<Waiter>,
}

impl ServiceEntry {
    fn connecting() -> Self {
        Self {
            handle: None,
            state: ConnectionState::Connecting,
            attempts: 0,
            last_used: Instant::now(),
            health_task: None,
            retry_task: None,
            waiters: Vec::new(),
        }
    }

    /// Abort background tasks and reject queued waiters with `err`.
    fn teardown(&mut self, err: &ConnectError) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

enum Step {
    Ready(Arc<dyn Transport>),
    Wait(oneshot::Receiver<Result<Arc<dyn Transport>, ConnectError>>),
    DialAndWait(oneshot::Receiver<Result<Arc<dyn Transport>, ConnectError>>),
}

/// Owns every outbound service connection, one per logical service name.
///
/// Clones share the same connection table; the idle sweep is started once at
/// construction and stopped by [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<Config>,
    factory: Arc<dyn TransportFactory>,
    connections: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    sweep_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Create a new connection manager and start its idle eviction sweep
    pub fn new(config: Config, factory: Arc<dyn TransportFactory>) -> Self {
        let manager = Self {
            config: Arc::new(config),
            factory,
            connections: Arc::new(RwLock::new(HashMap::new())),
            sweep_task: Arc::new(std::sync::Mutex::new(None)),
        };

        let sweep = manager.spawn_sweep_task();
        if let Ok(mut guard) = manager.sweep_task.lock() {
            *guard = Some(sweep);
        }

        manager
    }

    /// Shared configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve a live transport handle for `service` (or the default service).
    ///
    /// Exactly one dial is ever in flight per service name: concurrent
    /// callers either receive the existing Connected handle or join the
    /// in-flight attempt's waiter queue, bounded by the configured wait
    /// timeout.
    pub async fn get_connection(
        &self,
        service: Option<&str>,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        let name = self.resolve_name(service);

        let step = {
            let mut table = self.connections.write().await;
            match table.get_mut(&name) {
                Some(entry) => match (entry.state, entry.handle.clone()) {
                    (ConnectionState::Connected, Some(handle)) => {
                        entry.last_used = Instant::now();
                        Step::Ready(handle)
                    }
                    (ConnectionState::Connecting, _) => {
                        let (tx, rx) = oneshot::channel();
                        entry.waiters.push(tx);
                        Step::Wait(rx)
                    }
                    _ => {
                        debug!(service = %name, "reconnecting service");
                        entry.state = ConnectionState::Connecting;
                        if let Some(task) = entry.retry_task.take() {
                            task.abort();
                        }
                        let (tx, rx) = oneshot::channel();
                        entry.waiters.push(tx);
                        Step::DialAndWait(rx)
                    }
                },
                None => {
                    debug!(service = %name, "creating connection entry");
                    let mut entry = ServiceEntry::connecting();
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    table.insert(name.clone(), entry);
                    Step::DialAndWait(rx)
                }
            }
        };

        match step {
            Step::Ready(handle) => Ok(handle),
            Step::Wait(rx) => self.await_waiter(name, rx).await,
            Step::DialAndWait(rx) => {
                let manager = self.clone();
                let dial_name = name.clone();
                tokio::spawn(async move {
                    manager.connect_attempt(&dial_name).await;
                });
                self.await_waiter(name, rx).await
            }
        }
    }

    /// Close and remove one service entry. Idempotent; close failures are
    /// logged, never raised, so table cleanup always completes.
    pub async fn disconnect(&self, service: &str) {
        let removed = {
            let mut table = self.connections.write().await;
            table.remove(service).map(|mut entry| {
                let err = ConnectError::ConnectFailed {
                    service: service.to_string(),
                    attempts: entry.attempts,
                };
                entry.teardown(&err);
                entry
            })
        };

        if let Some(entry) = removed {
            if let Some(handle) = entry.handle {
                if let Err(err) = handle.close().await {
                    warn!(service = %service, error = %err, "error closing connection");
                }
            }
            info!(service = %service, "disconnected");
        }
    }

    /// Disconnect every service in parallel and stop the idle sweep.
    /// Best-effort: individual close failures never block the rest.
    pub async fn shutdown(&self) {
        info!("shutting down connection manager");

        if let Ok(mut guard) = self.sweep_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }

        let names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            let manager = self.clone();
            tasks.push(tokio::spawn(async move {
                manager.disconnect(&name).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Whether `service` currently has a live connection
    pub async fn is_connected(&self, service: Option<&str>) -> bool {
        let name = self.resolve_name(service);
        let table = self.connections.read().await;
        table
            .get(&name)
            .map(|entry| entry.state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    /// Status snapshot for one service, if it has a table entry
    pub async fn service_status(&self, service: &str) -> Option<ServiceStatus> {
        let table = self.connections.read().await;
        table.get(service).map(|entry| ServiceStatus {
            state: entry.state,
            attempts: entry.attempts,
            idle_for: entry.last_used.elapsed(),
        })
    }

    /// Status snapshot for every known service
    pub async fn all_statuses(&self) -> HashMap<String, ServiceStatus> {
        let table = self.connections.read().await;
        table
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ServiceStatus {
                        state: entry.state,
                        attempts: entry.attempts,
                        idle_for: entry.last_used.elapsed(),
                    },
                )
            })
            .collect()
    }

    /// Tear the connection down and dial again. Callers arriving during the
    /// gap join the new attempt's waiter queue instead of racing a dial.
    pub async fn force_reconnect(&self, service: Option<&str>) -> Result<(), ConnectError> {
        let name = self.resolve_name(service);
        info!(service = %name, "force reconnecting");
        self.disconnect(&name).await;
        self.get_connection(Some(&name)).await.map(|_| ())
    }

    /// Round-trip latency probe through the request protocol. Never fails;
    /// the outcome is reported in the returned struct.
    pub async fn test_connection(&self, service: Option<&str>) -> ConnectionTest {
        let name = self.resolve_name(service);
        let started = Instant::now();

        let handle = match self.get_connection(Some(&name)).await {
            Ok(handle) => handle,
            Err(err) => {
                return ConnectionTest {
                    success: false,
                    latency: None,
                    error: Some(err.to_string()),
                }
            }
        };

        match timeout(TEST_PROBE_TIMEOUT, handle.send(HEALTH_CHECK_PATTERN, json!({}))).await {
            Ok(Ok(_)) => ConnectionTest {
                success: true,
                latency: Some(started.elapsed()),
                error: None,
            },
            Ok(Err(err)) => ConnectionTest {
                success: false,
                latency: None,
                error: Some(err.to_string()),
            },
            Err(_) => ConnectionTest {
                success: false,
                latency: None,
                error: Some("test timeout".to_string()),
            },
        }
    }

    /// Pre-connect to `services` in parallel. Failures are logged, not raised.
    pub async fn warmup(&self, services: &[String]) {
        info!(services = ?services, "warming up connections");
        let mut tasks = Vec::with_capacity(services.len());
        for name in services {
            let manager = self.clone();
            let name = name.clone();
            tasks.push(tokio::spawn(async move {
                match manager.get_connection(Some(&name)).await {
                    Ok(_) => debug!(service = %name, "warmed up"),
                    Err(err) => warn!(service = %name, error = %err, "warmup failed"),
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    fn resolve_name(&self, service: Option<&str>) -> String {
        match service {
            Some(name) => name.to_string(),
            None => self.config.default_service_name(),
        }
    }

    async fn await_waiter(
        &self,
        name: String,
        rx: oneshot::Receiver<Result<Arc<dyn Transport>, ConnectError>>,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        let wait = Duration::from_millis(self.config.manager.wait_timeout_ms);
        match timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectError::ConnectFailed {
                service: name,
                attempts: 0,
            }),
            Err(_) => Err(ConnectError::ConnectTimeout { service: name }),
        }
    }

    /// Run one dial attempt for `name`, settling the entry and its waiters.
    async fn connect_attempt(&self, name: &str) {
        let svc = self.config.service(name);

        let attempt = {
            let mut table = self.connections.write().await;
            match table.get_mut(name) {
                Some(entry) => {
                    entry.attempts += 1;
                    entry.attempts
                }
                // entry removed before the dial started
                None => return,
            }
        };

        info!(
            service = %name,
            host = %svc.host,
            port = svc.port,
            attempt,
            "connecting"
        );

        match timeout(svc.connect_timeout, self.factory.connect(&svc.host, svc.port)).await {
            Ok(Ok(handle)) => self.install_connection(name, handle, &svc).await,
            Ok(Err(err)) => {
                let cause = connect_error(name, &err);
                self.dial_failed(name, &svc, attempt, cause).await;
            }
            Err(_) => {
                let cause = ConnectError::ConnectTimeout {
                    service: name.to_string(),
                };
                self.dial_failed(name, &svc, attempt, cause).await;
            }
        }
    }

    /// Promote a fresh handle to Connected and resolve all waiters.
    async fn install_connection(
        &self,
        name: &str,
        handle: Arc<dyn Transport>,
        svc: &ServiceConfig,
    ) {
        self.register_handlers(name, handle.as_ref());
        let health = self.spawn_health_task(name.to_string(), Arc::clone(&handle), svc);

        let orphaned = {
            let mut table = self.connections.write().await;
            match table.get_mut(name) {
                Some(entry) => {
                    if let Some(task) = entry.health_task.take() {
                        task.abort();
                    }
                    if let Some(task) = entry.retry_task.take() {
                        task.abort();
                    }
                    entry.handle = Some(Arc::clone(&handle));
                    entry.state = ConnectionState::Connected;
                    entry.attempts = 0;
                    entry.last_used = Instant::now();
                    entry.health_task = Some(health);
                    for waiter in entry.waiters.drain(..) {
                        let _ = waiter.send(Ok(Arc::clone(&handle)));
                    }
                    info!(service = %name, "connected");
                    None
                }
                // entry removed while dialing; don't keep the orphan handle
                None => {
                    health.abort();
                    Some(handle)
                }
            }
        };

        if let Some(handle) = orphaned {
            if let Err(err) = handle.close().await {
                debug!(service = %name, error = %err, "closing orphaned connection failed");
            }
        }
    }

    /// Settle a failed dial: reject waiters, schedule a retry, or tear the
    /// entry down once the attempt budget is spent.
    async fn dial_failed(
        &self,
        name: &str,
        svc: &ServiceConfig,
        attempt: u32,
        cause: ConnectError,
    ) {
        warn!(service = %name, attempt, error = %cause, "connect attempt failed");

        let mut table = self.connections.write().await;

        if attempt >= svc.max_connect_attempts {
            error!(
                service = %name,
                attempts = attempt,
                "max connect attempts reached; removing service entry"
            );
            let terminal = ConnectError::ConnectFailed {
                service: name.to_string(),
                attempts: attempt,
            };
            let stale = table.remove(name).and_then(|mut entry| {
                entry.teardown(&terminal);
                entry.handle.take()
            });
            drop(table);
            if let Some(handle) = stale {
                if let Err(err) = handle.close().await {
                    debug!(service = %name, error = %err, "closing stale connection failed");
                }
            }
            return;
        }

        let Some(entry) = table.get_mut(name) else {
            return;
        };
        entry.state = ConnectionState::Disconnected;

        // Current waiters are rejected now; the scheduled retry only
        // self-heals the entry for future callers.
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(Err(cause.clone()));
        }

        let ceiling = Duration::from_millis(self.config.manager.backoff_ceiling_ms);
        let delay = backoff_delay(svc.retry_delay, attempt, ceiling);
        warn!(
            service = %name,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let manager = self.clone();
        let service = name.to_string();
        entry.retry_task = Some(tokio::spawn(async move {
            sleep(delay).await;
            manager.background_redial(&service).await;
        }));
    }

    /// Reconnect fired from a scheduled retry; skipped if the entry is gone
    /// or another caller already started a dial.
    ///
    /// Returns a boxed future to break the mutually-recursive `Send`
    /// auto-trait cycle (`connect_attempt` → `dial_failed` → spawn →
    /// `background_redial` → `connect_attempt`); the concrete `+ Send` return
    /// type gives inference a fixed point to terminate on.
    fn background_redial<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut table = self.connections.write().await;
                match table.get_mut(name) {
                    Some(entry) if entry.state == ConnectionState::Disconnected => {
                        entry.state = ConnectionState::Connecting;
                        entry.retry_task = None;
                    }
                    _ => return,
                }
            }
            self.connect_attempt(name).await;
        })
    }

    /// Flip the entry to Disconnected when the transport reports trouble.
    fn register_handlers(&self, name: &str, handle: &dyn Transport) {
        let manager = self.clone();
        let service = name.to_string();
        handle.on_close(Box::new(move || {
            let manager = manager.clone();
            let service = service.clone();
            tokio::spawn(async move {
                warn!(service = %service, "transport closed by peer");
                manager.mark_disconnected(&service).await;
            });
        }));

        let manager = self.clone();
        let service = name.to_string();
        handle.on_error(Box::new(move |err| {
            let manager = manager.clone();
            let service = service.clone();
            tokio::spawn(async move {
                error!(service = %service, error = %err, "transport error");
                manager.mark_disconnected(&service).await;
            });
        }));
    }

    async fn mark_disconnected(&self, name: &str) {
        let mut table = self.connections.write().await;
        if let Some(entry) = table.get_mut(name) {
            if entry.state == ConnectionState::Connected {
                entry.state = ConnectionState::Disconnected;
            }
        }
    }

    /// Periodic liveness probe for one connection. Flips Connected ⇄
    /// Disconnected on probe outcome; never touches an entry mid-dial, and
    /// stops as soon as the entry moves to a different handle.
    fn spawn_health_task(
        &self,
        name: String,
        handle: Arc<dyn Transport>,
        svc: &ServiceConfig,
    ) -> JoinHandle<()> {
        let connections = Arc::clone(&self.connections);
        let probe_timeout = Duration::from_millis(self.config.manager.health_probe_timeout_ms);
        let period = svc.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // the first tick of an interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let healthy = matches!(
                    timeout(probe_timeout, handle.send(HEALTH_CHECK_PATTERN, json!({}))).await,
                    Ok(Ok(_))
                );

                let mut table = connections.write().await;
                let Some(entry) = table.get_mut(&name) else {
                    break;
                };
                let same_handle = entry
                    .handle
                    .as_ref()
                    .map(|current| Arc::ptr_eq(current, &handle))
                    .unwrap_or(false);
                if !same_handle {
                    break;
                }

                match (healthy, entry.state) {
                    (false, ConnectionState::Connected) => {
                        entry.state = ConnectionState::Disconnected;
                        warn!(service = %name, "health check failed; marking disconnected");
                    }
                    (true, ConnectionState::Disconnected) => {
                        entry.state = ConnectionState::Connected;
                        info!(service = %name, "health check passed; connection restored");
                    }
                    _ => {
                        debug!(service = %name, healthy, "health check");
                    }
                }
            }
        })
    }

    fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_millis(self.config.manager.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.evict_idle().await;
            }
        })
    }

    async fn evict_idle(&self) {
        let now = Instant::now();
        let idle: Vec<String> = {
            let table = self.connections.read().await;
            table
                .iter()
                .filter(|(name, entry)| {
                    entry.state == ConnectionState::Connected
                        && now.duration_since(entry.last_used) > self.config.service(name).idle_timeout
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in idle {
            info!(service = %name, "closing idle connection");
            self.disconnect(&name).await;
        }
    }
}

fn connect_error(service: &str, err: &TransportError) -> ConnectError {
    match err {
        TransportError::HostNotFound(_) => ConnectError::HostNotFound {
            service: service.to_string(),
        },
        other => ConnectError::Transport {
            service: service.to_string(),
            message: other.to_string(),
        },
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `ceiling`.
fn backoff_delay(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(ceiling)
}
