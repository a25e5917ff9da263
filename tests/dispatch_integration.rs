//! Integration tests for request dispatch
//!
//! Retry budgets, batch ordering, envelope normalization and the never-throw
//! guarantees of emit and health checks, driven against scripted transports.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use svcpool::config::{Config, ServiceProfile};
use svcpool::dispatch::{
    BatchOptions, BatchRequest, DispatchError, EmitOptions, RequestDispatcher, SendOptions,
};
use svcpool::pool::ConnectionManager;
use svcpool::transport::TransportError;

use common::{test_config, MockFactory};

fn dispatcher_with(factory: Arc<MockFactory>, config: Config) -> RequestDispatcher {
    RequestDispatcher::new(ConnectionManager::new(config, factory))
}

#[tokio::test(start_paused = true)]
async fn send_request_normalizes_replies() {
    let factory = Arc::new(MockFactory::with_reply(|pattern, _| match pattern {
        "raw" => Ok(json!({"id": 1, "name": "a"})),
        "wrapped" => Ok(json!({"success": true, "data": {"ok": true}})),
        "denied" => Ok(json!({"success": false, "error": "boom"})),
        _ => Ok(json!("garbage")),
    }));
    let dispatcher = dispatcher_with(factory, test_config("users"));

    let value = dispatcher
        .send_request("raw", json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!({"id": 1, "name": "a"}));

    let value = dispatcher
        .send_request("wrapped", json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!({"ok": true}));

    let err = dispatcher
        .send_request("denied", json!({}), SendOptions::default())
        .await
        .unwrap_err();
    match err {
        DispatchError::Remote { pattern, message } => {
            assert_eq!(pattern, "denied");
            assert_eq!(message, "boom");
        }
        other => panic!("expected Remote, got {other}"),
    }

    let err = dispatcher
        .send_request("mystery", json!({}), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidResponse { .. }));
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_spends_the_full_budget() {
    let factory = Arc::new(MockFactory::with_reply(|_, _| {
        Err(TransportError::Refused("backend gone".to_string()))
    }));
    let dispatcher = dispatcher_with(factory.clone(), test_config("users"));

    let options = SendOptions {
        retries: Some(2),
        retry_delay: Some(Duration::from_millis(10)),
        ..SendOptions::default()
    };
    let err = dispatcher
        .send_request("list_users", json!({}), options)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Transport { .. }));
    // retries + 1 attempts total
    assert_eq!(factory.transport(0).send_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn remote_error_is_not_retried() {
    let factory = Arc::new(MockFactory::with_reply(|_, _| {
        Ok(json!({"success": false, "error": "denied"}))
    }));
    let dispatcher = dispatcher_with(factory.clone(), test_config("users"));

    let err = dispatcher
        .send_request("create_user", json!({"name": "a"}), SendOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Remote { .. }));
    assert_eq!(factory.transport(0).send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_service_reports_unavailable_without_retries() {
    let factory = MockFactory::ok();
    factory.fail_dials.store(true, Ordering::SeqCst);
    let factory = Arc::new(factory);

    let mut config = test_config("users");
    config.services.insert(
        "users".to_string(),
        ServiceProfile {
            retry_attempts: 1,
            ..ServiceProfile::default()
        },
    );
    let dispatcher = dispatcher_with(factory.clone(), config);

    let err = dispatcher
        .send_request("list_users", json!({}), SendOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::ServiceUnavailable { .. }));
    // no request retry budget is spent on acquisition failures
    assert_eq!(factory.dial_count(), 1);
    assert_eq!(factory.total_sends(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_reply_surfaces_request_timeout() {
    let mut factory = MockFactory::ok();
    factory.reply_delay = Duration::from_secs(60);
    let factory = Arc::new(factory);
    let dispatcher = dispatcher_with(factory, test_config("users"));

    let options = SendOptions {
        timeout: Some(Duration::from_millis(50)),
        retries: Some(0),
        ..SendOptions::default()
    };
    let err = dispatcher
        .send_request("slow_report", json!({}), options)
        .await
        .unwrap_err();

    match err {
        DispatchError::RequestTimeout { pattern, timeout_ms } => {
            assert_eq!(pattern, "slow_report");
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("expected RequestTimeout, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn batch_best_effort_preserves_input_order() {
    let factory = Arc::new(MockFactory::with_reply(|pattern, _| match pattern {
        "p1" => Ok(json!({"success": true, "data": 1})),
        "p2" => Ok(json!({"success": false, "error": "err2"})),
        _ => Ok(json!({"success": true, "data": 3})),
    }));
    let dispatcher = dispatcher_with(factory, test_config("users"));

    let requests = vec![
        BatchRequest::new("p1", json!({})),
        BatchRequest::new("p2", json!({})),
        BatchRequest::new("p3", json!({})),
    ];
    let outcomes = dispatcher
        .send_batch(requests, BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].pattern, "p1");
    assert_eq!(outcomes[0].result.as_ref().unwrap(), &json!(1));
    assert_eq!(outcomes[1].pattern, "p2");
    assert!(
        matches!(&outcomes[1].result, Err(DispatchError::Remote { message, .. }) if message == "err2")
    );
    assert_eq!(outcomes[2].pattern, "p3");
    assert_eq!(outcomes[2].result.as_ref().unwrap(), &json!(3));
}

#[tokio::test(start_paused = true)]
async fn batch_fail_fast_propagates_the_failure() {
    let factory = Arc::new(MockFactory::with_reply(|pattern, _| match pattern {
        "p2" => Ok(json!({"success": false, "error": "err2"})),
        _ => Ok(json!({"success": true, "data": "fine"})),
    }));
    let dispatcher = dispatcher_with(factory, test_config("users"));

    let requests = vec![
        BatchRequest::new("p1", json!({})),
        BatchRequest::new("p2", json!({})),
        BatchRequest::new("p3", json!({})),
    ];
    let options = BatchOptions {
        fail_fast: true,
        ..BatchOptions::default()
    };
    let err = dispatcher.send_batch(requests, options).await.unwrap_err();

    assert!(matches!(err, DispatchError::Remote { message, .. } if message == "err2"));
}

#[tokio::test(start_paused = true)]
async fn send_to_services_keys_outcomes_by_name() {
    let factory = Arc::new(MockFactory::ok());
    let dispatcher = dispatcher_with(factory.clone(), test_config("users"));

    let services = vec!["users".to_string(), "billing".to_string()];
    let outcomes = dispatcher
        .send_to_services(&services, "ping", json!({}), BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes["users"].is_ok());
    assert!(outcomes["billing"].is_ok());
    // one connection per target service
    assert_eq!(factory.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn emit_delivers_without_waiting() {
    let factory = Arc::new(MockFactory::ok());
    let dispatcher = dispatcher_with(factory.clone(), test_config("users"));

    dispatcher
        .emit("user_updated", json!({"id": 7}), EmitOptions::default())
        .await;

    let transport = factory.transport(0);
    let emits = transport.emits.lock().unwrap();
    assert_eq!(emits.len(), 1);
    assert_eq!(emits[0].0, "user_updated");
    assert_eq!(emits[0].1, json!({"id": 7}));
}

#[tokio::test(start_paused = true)]
async fn emit_swallows_unreachable_service() {
    let factory = MockFactory::ok();
    factory.fail_dials.store(true, Ordering::SeqCst);
    let factory = Arc::new(factory);

    let mut config = test_config("users");
    config.services.insert(
        "users".to_string(),
        ServiceProfile {
            retry_attempts: 1,
            ..ServiceProfile::default()
        },
    );
    let dispatcher = dispatcher_with(factory, config);

    // must return normally; the failure is only logged
    dispatcher
        .emit("user_updated", json!({"id": 7}), EmitOptions::default())
        .await;
}

#[tokio::test(start_paused = true)]
async fn check_health_reports_booleans() {
    let factory = Arc::new(MockFactory::ok());
    let dispatcher = dispatcher_with(factory, test_config("users"));
    assert!(dispatcher.check_health(None).await);

    let failing = MockFactory::with_reply(|_, _| Err(TransportError::Closed));
    let dispatcher = dispatcher_with(Arc::new(failing), test_config("users"));
    assert!(!dispatcher.check_health(Some("users")).await);
}

#[tokio::test(start_paused = true)]
async fn check_health_many_covers_every_service() {
    let factory = Arc::new(MockFactory::ok());
    let dispatcher = dispatcher_with(factory, test_config("users"));

    let services = vec!["users".to_string(), "billing".to_string()];
    let statuses = dispatcher.check_health_many(&services).await;

    assert_eq!(statuses.len(), 2);
    assert!(statuses["users"]);
    assert!(statuses["billing"]);
}

#[tokio::test(start_paused = true)]
async fn raw_value_round_trips_untouched() {
    let factory = Arc::new(MockFactory::with_reply(|_, payload| {
        // echo the payload back as a raw object
        Ok(payload.clone())
    }));
    let dispatcher = dispatcher_with(factory, test_config("users"));

    let payload = json!({"id": 42, "tags": ["a", "b"]});
    let value: Value = dispatcher
        .send_request("echo", payload.clone(), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(value, payload);
}
