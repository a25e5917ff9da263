//! Request dispatch over managed connections
//!
//! Turns a (pattern, payload) request into a validated reply value using a
//! connection from the [`ConnectionManager`], with timeout, retry and
//! envelope normalization. Also provides fire-and-forget emit and batch /
//! multi-service fan-out helpers.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::pool::{ConnectError, ConnectionManager, HEALTH_CHECK_PATTERN};
use crate::transport::{Reply, TransportError};

/// Default bound on a single request/reply exchange
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default retry budget for retryable failures
const DEFAULT_RETRIES: u32 = 3;
/// Base delay between retries, scaled linearly by attempt number
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Bound on health check probes
const HEALTH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Dispatch error types
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("service '{service}' unavailable: {source}")]
    ServiceUnavailable {
        service: String,
        #[source]
        source: ConnectError,
    },

    #[error("request '{pattern}' timed out after {timeout_ms}ms")]
    RequestTimeout { pattern: String, timeout_ms: u64 },

    #[error("host not found for request '{pattern}'")]
    HostNotFound { pattern: String },

    #[error("invalid response for request '{pattern}'")]
    InvalidResponse { pattern: String },

    #[error("service error for request '{pattern}': {message}")]
    Remote { pattern: String, message: String },

    #[error("transport failure for request '{pattern}': {source}")]
    Transport {
        pattern: String,
        #[source]
        source: TransportError,
    },
}

impl DispatchError {
    /// Failures worth re-sending with the same pattern and payload
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::RequestTimeout { .. } => true,
            DispatchError::Transport { source, .. } => matches!(
                source,
                TransportError::Refused(_)
                    | TransportError::Closed
                    | TransportError::ConnectFailed(_)
            ),
            _ => false,
        }
    }
}

/// Options for a single request/reply exchange
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Target service override; the manager's default service otherwise
    pub service: Option<String>,
}

/// Options for fire-and-forget sends
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub service: Option<String>,
}

/// One entry in a batch dispatch
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub pattern: String,
    pub payload: Value,
    pub service: Option<String>,
}

impl BatchRequest {
    pub fn new(pattern: impl Into<String>, payload: Value) -> Self {
        Self {
            pattern: pattern.into(),
            payload,
            service: None,
        }
    }
}

/// Outcome of one batch entry, tagged with its originating pattern
#[derive(Debug)]
pub struct BatchOutcome {
    pub pattern: String,
    pub result: Result<Value, DispatchError>,
}

/// Options for batch and multi-service dispatch
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Abort on the first failure instead of collecting every outcome
    pub fail_fast: bool,
}

/// Sends requests over connections owned by a [`ConnectionManager`].
///
/// Clones share the manager's connection table, so a dispatcher can be handed
/// to request handlers freely.
#[derive(Clone)]
pub struct RequestDispatcher {
    manager: ConnectionManager,
}

impl RequestDispatcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// The connection manager backing this dispatcher
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Request/reply exchange with timeout and linear-backoff retry.
    ///
    /// The reply is normalized before it reaches the caller: raw objects are
    /// returned as-is, success envelopes are unwrapped to their `data` field,
    /// and error envelopes surface as [`DispatchError::Remote`].
    pub async fn send_request(
        &self,
        pattern: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Value, DispatchError> {
        let request_timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let retries = options.retries.unwrap_or(DEFAULT_RETRIES);
        let retry_delay = options.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
        let service = options
            .service
            .clone()
            .unwrap_or_else(|| self.manager.config().default_service_name());

        debug!(service = %service, pattern = %pattern, "sending request");

        // Acquisition spends no retry budget: an unreachable service is
        // reported as-is while the manager's own backoff does the healing.
        let handle = self
            .manager
            .get_connection(Some(&service))
            .await
            .map_err(|source| DispatchError::ServiceUnavailable {
                service: service.clone(),
                source,
            })?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let failure = match timeout(request_timeout, handle.send(pattern, payload.clone())).await
            {
                Ok(Ok(reply)) => return normalize_reply(pattern, reply),
                Ok(Err(err)) => classify_transport(pattern, err),
                Err(_) => DispatchError::RequestTimeout {
                    pattern: pattern.to_string(),
                    timeout_ms: request_timeout.as_millis() as u64,
                },
            };

            if !failure.is_retryable() || attempt > retries {
                warn!(
                    service = %service,
                    pattern = %pattern,
                    attempts = attempt,
                    error = %failure,
                    "request failed"
                );
                return Err(failure);
            }

            warn!(
                service = %service,
                pattern = %pattern,
                attempt,
                retries,
                "retrying request"
            );
            sleep(retry_delay * attempt).await;
        }
    }

    /// Fire-and-forget send. Failures are logged and swallowed so emit never
    /// disturbs the caller's control flow.
    pub async fn emit(&self, pattern: &str, payload: Value, options: EmitOptions) {
        let service = options
            .service
            .clone()
            .unwrap_or_else(|| self.manager.config().default_service_name());

        debug!(service = %service, pattern = %pattern, "emitting message");

        match self.manager.get_connection(Some(&service)).await {
            Ok(handle) => {
                if let Err(err) = handle.emit(pattern, payload).await {
                    warn!(service = %service, pattern = %pattern, error = %err, "emit failed");
                }
            }
            Err(err) => {
                warn!(
                    service = %service,
                    pattern = %pattern,
                    error = %err,
                    "emit skipped; service unreachable"
                );
            }
        }
    }

    /// Dispatch every request in parallel. Outcomes come back in input order
    /// regardless of completion order; in fail-fast mode the first failure
    /// (in input order) propagates instead and no outcome vector is built.
    pub async fn send_batch(
        &self,
        requests: Vec<BatchRequest>,
        options: BatchOptions,
    ) -> Result<Vec<BatchOutcome>, DispatchError> {
        debug!(count = requests.len(), fail_fast = options.fail_fast, "sending batch");

        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            let dispatcher = self.clone();
            let send_options = SendOptions {
                timeout: options.timeout,
                retries: options.retries,
                retry_delay: options.retry_delay,
                service: request.service.clone(),
            };
            let pattern = request.pattern.clone();
            tasks.push((
                pattern,
                tokio::spawn(async move {
                    dispatcher
                        .send_request(&request.pattern, request.payload, send_options)
                        .await
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (pattern, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(err) => Err(DispatchError::Transport {
                    pattern: pattern.clone(),
                    source: TransportError::Other(err.to_string()),
                }),
            };
            match (options.fail_fast, result) {
                (true, Err(err)) => return Err(err),
                (_, result) => outcomes.push(BatchOutcome { pattern, result }),
            }
        }

        Ok(outcomes)
    }

    /// Same pattern and payload to many services; outcomes keyed by service
    /// name since target identity matters more than arrival order.
    pub async fn send_to_services(
        &self,
        services: &[String],
        pattern: &str,
        payload: Value,
        options: BatchOptions,
    ) -> Result<HashMap<String, Result<Value, DispatchError>>, DispatchError> {
        debug!(services = ?services, pattern = %pattern, "sending to multiple services");

        let requests = services
            .iter()
            .map(|service| BatchRequest {
                pattern: pattern.to_string(),
                payload: payload.clone(),
                service: Some(service.clone()),
            })
            .collect();

        let outcomes = self.send_batch(requests, options).await?;

        Ok(services
            .iter()
            .cloned()
            .zip(outcomes.into_iter().map(|outcome| outcome.result))
            .collect())
    }

    /// Liveness probe through the request path. Never fails.
    pub async fn check_health(&self, service: Option<&str>) -> bool {
        let options = SendOptions {
            timeout: Some(HEALTH_TIMEOUT),
            retries: Some(1),
            service: service.map(str::to_string),
            ..SendOptions::default()
        };

        match self.send_request(HEALTH_CHECK_PATTERN, json!({}), options).await {
            Ok(_) => true,
            Err(err) => {
                warn!(service = ?service, error = %err, "health check failed");
                false
            }
        }
    }

    /// Probe several services in parallel; false for any failure
    pub async fn check_health_many(&self, services: &[String]) -> HashMap<String, bool> {
        let mut tasks = Vec::with_capacity(services.len());
        for service in services {
            let dispatcher = self.clone();
            let name = service.clone();
            tasks.push((
                service.clone(),
                tokio::spawn(async move { dispatcher.check_health(Some(&name)).await }),
            ));
        }

        let mut statuses = HashMap::with_capacity(tasks.len());
        for (service, task) in tasks {
            statuses.insert(service, task.await.unwrap_or(false));
        }
        statuses
    }
}

fn classify_transport(pattern: &str, err: TransportError) -> DispatchError {
    match err {
        TransportError::HostNotFound(_) => DispatchError::HostNotFound {
            pattern: pattern.to_string(),
        },
        other => DispatchError::Transport {
            pattern: pattern.to_string(),
            source: other,
        },
    }
}

/// Collapse a classified transport reply into its caller-facing value.
fn normalize_reply(pattern: &str, reply: Value) -> Result<Value, DispatchError> {
    match Reply::classify(reply) {
        Some(Reply::Raw(value)) => Ok(value),
        Some(Reply::Envelope(envelope)) if envelope.success => {
            Ok(envelope.data.unwrap_or(Value::Null))
        }
        Some(Reply::Envelope(envelope)) => Err(DispatchError::Remote {
            pattern: pattern.to_string(),
            message: envelope
                .error
                .or(envelope.message)
                .unwrap_or_else(|| "service error".to_string()),
        }),
        None => Err(DispatchError::InvalidResponse {
            pattern: pattern.to_string(),
        }),
    }
}
