//! End-to-end tests for the dispatch pipeline and task queue.

use std::time::Duration;

use anyhow::Result;
use depesche_delivery::{
    BreakerConfig, BreakerState, DeliveryError, DispatcherConfig, Message, PoolConfig,
    QueueConfig, RetryPolicy, TaskStatus,
};
use depesche_testing::{notification, TestEnv, TestEnvBuilder};

fn single_attempt_config() -> DispatcherConfig {
    DispatcherConfig {
        breaker: BreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(30) },
        pool: PoolConfig {
            capacity: 2,
            acquire_timeout: Duration::from_millis(100),
            idle_ttl: Duration::from_secs(300),
        },
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
        },
        ..DispatcherConfig::default()
    }
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_recovers_through_one_probe() -> Result<()> {
    let env = TestEnvBuilder::new().dispatcher_config(single_attempt_config()).start();
    env.transport.script_failures(3, DeliveryError::transient("connection reset"));

    // Three consecutive transient failures open the breaker.
    for _ in 0..3 {
        let err = env.dispatcher.send(notification("user@example.com")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transient { .. }));
    }
    assert_eq!(env.dispatcher.breaker().snapshot().await.state, BreakerState::Open);

    // The next call fails fast with no session acquisition.
    let connects = env.transport.connect_count();
    let err = env.dispatcher.send(notification("user@example.com")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::CircuitOpen));
    assert_eq!(env.transport.connect_count(), connects);

    // After the cooldown the single probe goes through and closes it.
    env.clock.advance(Duration::from_secs(31));
    env.dispatcher.send(notification("user@example.com")).await?;
    assert_eq!(env.dispatcher.breaker().snapshot().await.state, BreakerState::Closed);

    env.shutdown().await
}

#[tokio::test]
async fn async_task_retries_through_the_state_machine() -> Result<()> {
    let env = TestEnv::start();
    env.transport.script_failures(2, DeliveryError::transient("connection reset"));

    let id = env.dispatcher.send_async(notification("user@example.com")).await?;
    let status = env.wait_for_terminal(id).await?;

    assert_eq!(status.status, TaskStatus::Succeeded);
    assert_eq!(status.attempt_count, 3);
    assert_eq!(env.sent().len(), 1);
    assert_eq!(env.metrics.queue.retried.get(), 2);

    env.shutdown().await
}

#[tokio::test]
async fn exhausted_retries_end_failed_and_stay_failed() -> Result<()> {
    let env = TestEnv::start();
    // Default task budget is 3 retries, so 4 executions at most.
    env.transport.script_failures(16, DeliveryError::transient("connection reset"));

    let id = env.dispatcher.send_async(notification("user@example.com")).await?;
    let status = env.wait_for_terminal(id).await?;

    assert_eq!(status.status, TaskStatus::Failed);
    assert_eq!(status.attempt_count, 4);

    // A terminal task is never picked up again.
    env.settle().await;
    let after = env.queue.task_status(id).await.expect("still within retention");
    assert_eq!(after.attempt_count, 4);

    env.shutdown().await
}

#[tokio::test]
async fn queue_saturation_pushes_back_on_the_submitter() -> Result<()> {
    let env = TestEnvBuilder::new()
        .queue_config(QueueConfig { capacity: 1, ..QueueConfig::default() })
        .start();

    // Two rapid submissions; the queue holds one.
    let first = env.dispatcher.send_async(notification("a@example.com")).await;
    let second = env.dispatcher.send_async(notification("b@example.com")).await;

    assert!(first.is_ok());
    match second {
        Err(DeliveryError::QueueFull { capacity }) => assert_eq!(capacity, 1),
        other => panic!("expected queue backpressure, got {other:?}"),
    }

    env.shutdown().await
}

#[tokio::test]
async fn bulk_notifications_all_reach_the_wire() -> Result<()> {
    let env = TestEnv::start();

    let mut ids = Vec::new();
    for i in 0..10 {
        let message = Message::new(format!("user{i}@example.com"), "Batch", "Hello");
        ids.push(env.dispatcher.send_async(message).await?);
    }

    for id in ids {
        let status = env.wait_for_terminal(id).await?;
        assert_eq!(status.status, TaskStatus::Succeeded);
    }
    assert_eq!(env.sent().len(), 10);
    assert_eq!(env.metrics.dispatch.sent.get(), 10);

    env.shutdown().await
}

#[tokio::test]
async fn malformed_recipient_is_rejected_at_submission() -> Result<()> {
    let env = TestEnv::start();

    let err = env.dispatcher.send_async(notification("not an address")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Permanent { .. }));
    assert_eq!(env.metrics.queue.submitted.get(), 0);

    env.shutdown().await
}
