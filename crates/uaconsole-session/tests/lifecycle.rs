// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session lifecycle tests against the in-memory server.
//!
//! All tests run on a paused clock, so reconnect backoff and durable
//! checkpoints complete instantly while keeping their exact timing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use uaconsole_session::config::{DurableSchedule, ReconnectPolicy};
use uaconsole_session::error::{SessionError, SubscriptionError};
use uaconsole_session::session::{ChannelCallback, Notification, NotificationCallback, SessionEvent};
use uaconsole_session::{
    ClientConfig, EndpointTarget, MemorySink, QuitSignal, SessionLifecycleController, SessionState,
    SimulatedServer, SubscriptionSpec, TerminationReason,
};

// =============================================================================
// Test Helpers
// =============================================================================

const PRIMARY: &str = "opc.tcp://sim:4840";
const FALLBACK: &str = "opc.tcp://sim-backup:4840";

type Controller = SessionLifecycleController<SimulatedServer>;

fn base_config() -> uaconsole_session::ClientConfigBuilder {
    ClientConfig::builder()
        .endpoint(PRIMARY)
        .use_security(false)
        .poll_interval(Duration::from_secs(1))
}

fn controller(server: &SimulatedServer, config: ClientConfig) -> (Arc<Controller>, MemorySink) {
    let sink = MemorySink::new();
    let controller = SessionLifecycleController::new(server.clone(), config, Arc::new(sink.clone()));
    (Arc::new(controller), sink)
}

fn spec(server: &SimulatedServer, config: &ClientConfig) -> SubscriptionSpec {
    SubscriptionSpec::from_defaults(&config.subscription)
        .add_nodes(server.plant_variables().into_iter().take(10))
        .build()
        .unwrap()
}

async fn connected_with_subscription(server: &SimulatedServer, config: ClientConfig) -> (Arc<Controller>, MemorySink) {
    let (controller, sink) = controller(server, config);
    let spec = spec(server, controller.config());
    controller
        .connect(controller.config().endpoint.clone())
        .await
        .unwrap();
    controller.subscribe(spec).await.unwrap();
    (controller, sink)
}

fn events(controller: &Controller) -> Vec<SessionEvent> {
    controller.history().into_iter().map(|t| t.event).collect()
}

/// Records every notification with its arrival time.
#[derive(Clone, Default)]
struct ArrivalLog {
    arrivals: Arc<Mutex<Vec<(Instant, Notification)>>>,
}

impl ArrivalLog {
    fn snapshot(&self) -> Vec<(Instant, Notification)> {
        self.arrivals.lock().clone()
    }
}

#[async_trait]
impl NotificationCallback for ArrivalLog {
    async fn on_notification(&self, notification: Notification) {
        self.arrivals.lock().push((Instant::now(), notification));
    }
}

// =============================================================================
// Monitoring
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_within_one_poll_interval() {
    let server = SimulatedServer::new();
    let config = base_config().deadline(Some(Duration::from_millis(3500))).build().unwrap();
    let (controller, sink) = connected_with_subscription(&server, config).await;

    let started = Instant::now();
    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();

    assert_eq!(reason, TerminationReason::DeadlineExceeded);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3500));
    assert!(elapsed <= Duration::from_millis(4500));
    assert!(sink.contains("Monitoring ended: deadline exceeded"));
    assert_eq!(controller.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_quit_from_another_task() {
    let server = SimulatedServer::new();
    let config = base_config().deadline(None).build().unwrap();
    let (controller, _) = connected_with_subscription(&server, config).await;

    let quit = QuitSignal::new();
    let raiser = quit.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        raiser.raise();
    });

    let started = Instant::now();
    let reason = controller.monitor(&quit).await.unwrap();
    assert_eq!(reason, TerminationReason::QuitRequested);
    assert!(started.elapsed() <= Duration::from_millis(3500));

    controller.disconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::Closed);
    assert_eq!(server.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_notifications_reach_callback() {
    let server = SimulatedServer::new();
    let config = base_config().deadline(Some(Duration::from_secs(5))).build().unwrap();
    let (controller, _) = connected_with_subscription(&server, config).await;

    let (callback, mut rx) = ChannelCallback::with_channel(1024);
    controller.set_notification_callback(Arc::new(callback));
    controller.monitor(&QuitSignal::new()).await.unwrap();

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert!(received > 0);
    assert_eq!(controller.stats().snapshot().notifications, received);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_monitoring_is_refused() {
    let server = SimulatedServer::new();
    let config = base_config().deadline(Some(Duration::from_secs(3))).build().unwrap();
    let (controller, _) = controller(&server, config);
    controller
        .connect(controller.config().endpoint.clone())
        .await
        .unwrap();

    let monitoring = controller.clone();
    let monitor = tokio::spawn(async move { monitoring.monitor(&QuitSignal::new()).await });
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let err = controller
        .subscribe(spec(&server, controller.config()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Subscription(SubscriptionError::MonitoringActive)
    ));
    assert_eq!(server.subscription_count(), 0);

    let reason = monitor.await.unwrap().unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);
    controller
        .subscribe(spec(&server, controller.config()))
        .await
        .unwrap();
    assert_eq!(server.subscription_count(), 1);
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_then_success() {
    let server = SimulatedServer::new();
    let config = base_config().deadline(Some(Duration::from_secs(30))).build().unwrap();
    let (controller, sink) = connected_with_subscription(&server, config).await;
    let lost = controller.channel().unwrap();
    let server_id = controller.subscriptions().active().unwrap().server_id();

    server.fail_next_opens(3);
    server.drop_channel(lost);

    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);

    let report = controller.last_reconnect().unwrap();
    assert_eq!(report.attempts, 4);
    assert_eq!(
        report.delays,
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(controller.state(), SessionState::Connected);
    assert_ne!(controller.channel(), Some(lost));

    // The subscription moved over instead of being re-created.
    assert_eq!(server.transfers(), 1);
    assert_eq!(server.subscription_channel(server_id), controller.channel());
    assert!(sink.contains("Connected -> Reconnecting"));
    assert!(sink.contains("Reconnected on"));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_is_fatal() {
    let server = SimulatedServer::new();
    let config = base_config()
        .deadline(Some(Duration::from_secs(60)))
        .reconnect(ReconnectPolicy::default().with_max_attempts(3))
        .build()
        .unwrap();
    let (controller, sink) = connected_with_subscription(&server, config).await;

    server.set_unreachable(PRIMARY, true);
    server.drop_channel(controller.channel().unwrap());

    let started = Instant::now();
    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();

    assert_eq!(reason, TerminationReason::FatalError);
    assert_eq!(controller.state(), SessionState::FatallyFailed);
    // First tick, then 1s + 2s of backoff.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(sink.contains("Session failed"));
    assert!(sink.contains("UA-0501"));
    assert!(matches!(
        events(&controller).last(),
        Some(SessionEvent::RetriesExhausted { attempts: 3 })
    ));

    // A failed session stays failed.
    let again = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(again, TerminationReason::FatalError);
    controller.disconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::FatallyFailed);
}

fn unreachable_after_drop(server: &SimulatedServer, controller: &Controller) {
    server.set_unreachable(PRIMARY, true);
    server.drop_channel(controller.channel().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_quit_during_reconnect_backoff() {
    let server = SimulatedServer::new();
    let config = base_config()
        .deadline(None)
        .reconnect(ReconnectPolicy::default().with_max_attempts(5))
        .build()
        .unwrap();
    let (controller, sink) = connected_with_subscription(&server, config).await;
    unreachable_after_drop(&server, &controller);

    // Attempt 2 fails at 2s and starts a 2s backoff.
    let quit = QuitSignal::new();
    let raiser = quit.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        raiser.raise();
    });

    let started = Instant::now();
    let reason = controller.monitor(&quit).await.unwrap();

    assert_eq!(reason, TerminationReason::QuitRequested);
    assert!(started.elapsed() <= Duration::from_millis(3500));
    assert_eq!(controller.state(), SessionState::Reconnecting);
    assert!(sink.contains("Reconnect stopped after 2 attempt(s)"));
    assert_eq!(controller.last_reconnect().unwrap().attempts, 2);

    controller.disconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_reconnect_backoff() {
    let server = SimulatedServer::new();
    let config = base_config()
        .deadline(Some(Duration::from_secs(3)))
        .reconnect(ReconnectPolicy::default().with_max_attempts(5))
        .build()
        .unwrap();
    let (controller, _) = connected_with_subscription(&server, config).await;
    unreachable_after_drop(&server, &controller);

    let started = Instant::now();
    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();

    assert_eq!(reason, TerminationReason::DeadlineExceeded);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed <= Duration::from_secs(4));
    assert_ne!(controller.state(), SessionState::FatallyFailed);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_silence_triggers_reconnect() {
    let server = SimulatedServer::new();
    let config = base_config().deadline(Some(Duration::from_secs(12))).build().unwrap();
    let (controller, _) = connected_with_subscription(&server, config).await;
    let first = controller.channel().unwrap();

    server.pause_publishing(true);
    let resume = server.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        resume.pause_publishing(false);
    });

    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);

    let stats = controller.stats().snapshot();
    assert!(stats.keep_alive_timeouts >= 1);
    assert!(stats.reconnects >= 1);
    assert_eq!(controller.state(), SessionState::Connected);
    assert_ne!(controller.channel(), Some(first));
}

// =============================================================================
// Durable transfer
// =============================================================================

fn durable_config() -> uaconsole_session::ClientConfigBuilder {
    base_config()
        .durable_schedule(DurableSchedule {
            close_after: Duration::from_secs(5),
            restart_after: Duration::from_secs(10),
        })
        .deadline(Some(Duration::from_secs(20)))
}

#[tokio::test(start_paused = true)]
async fn test_durable_transfer_keeps_subscription() {
    let server = SimulatedServer::new();
    let (controller, sink) = connected_with_subscription(&server, durable_config().build().unwrap()).await;
    let handle = controller.subscriptions().active().unwrap();
    let server_id = handle.server_id();
    let items_before = handle.monitored_items().to_vec();
    let publishing_interval = handle.spec().publishing_interval();

    let log = ArrivalLog::default();
    controller.set_notification_callback(Arc::new(log.clone()));

    let started = Instant::now();
    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);

    assert!(sink.contains("Closing session at"));
    assert!(sink.contains("No communication interval 0"));
    assert!(sink.contains("Restarting session at"));
    assert!(sink.contains("Connected -> ClosedAwaitingTransfer (close checkpoint)"));
    assert!(sink.contains("Transferring -> Connected (subscription transferred to"));

    // Same server subscription, same monitored items, now on the new channel.
    assert_eq!(handle.server_id(), server_id);
    assert_eq!(server.transfers(), 1);
    assert_eq!(server.subscription_channel(server_id), controller.channel());
    assert_eq!(server.monitored_item_count(server_id), 10);
    assert_eq!(controller.stats().snapshot().transfers, 1);
    let after = controller.subscriptions().active().unwrap();
    assert_eq!(after.id(), handle.id());
    assert_eq!(after.monitored_items(), items_before.as_slice());

    let arrivals = log.snapshot();
    assert!(arrivals.iter().all(|(_, n)| n.subscription == handle.id()));

    // Nothing arrives while the session is closed.
    let close_at = started + Duration::from_secs(5);
    let restart_at = started + Duration::from_secs(10);
    assert!(!arrivals.iter().any(|(at, _)| *at > close_at && *at < restart_at));

    // Values resume within one publishing interval of the restart.
    let first_after_restart = arrivals
        .iter()
        .map(|(at, _)| *at)
        .find(|at| *at >= restart_at)
        .unwrap();
    assert!(first_after_restart - restart_at <= publishing_interval);
    assert!(arrivals.iter().filter(|(at, _)| *at >= restart_at).count() > 4);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_transfer_recreates_subscription() {
    let server = SimulatedServer::new();
    let (controller, sink) = connected_with_subscription(&server, durable_config().build().unwrap()).await;
    let handle = controller.subscriptions().active().unwrap();
    let old_id = handle.server_id();
    server.reject_transfers(true);

    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);

    assert_eq!(controller.state(), SessionState::Connected);
    assert!(sink.contains("Transfer failed"));
    assert!(sink.contains("Re-created subscription"));
    assert!(events(&controller)
        .iter()
        .any(|e| matches!(e, SessionEvent::TransferRejected { .. })));

    let new_id = handle.server_id();
    assert_ne!(new_id, old_id);
    assert_eq!(server.subscription_channel(new_id), controller.channel());
    assert_eq!(server.monitored_item_count(new_id), 10);
    assert_eq!(controller.stats().snapshot().transfer_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_uses_fallback_endpoint() {
    let server = SimulatedServer::new();
    let config = durable_config()
        .fallback_endpoint(FALLBACK)
        .build()
        .unwrap();
    let (controller, _) = connected_with_subscription(&server, config).await;
    let server_id = controller.subscriptions().active().unwrap().server_id();

    server.set_unreachable(PRIMARY, true);
    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();

    assert_eq!(reason, TerminationReason::DeadlineExceeded);
    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(server.transfers(), 1);
    assert_eq!(server.subscription_channel(server_id), controller.channel());
}

#[tokio::test(start_paused = true)]
async fn test_durable_close_skipped_without_subscription() {
    let server = SimulatedServer::new();
    let (controller, sink) = controller(&server, durable_config().build().unwrap());
    controller
        .connect(EndpointTarget::new(PRIMARY).with_security(false))
        .await
        .unwrap();

    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);
    assert!(sink.contains("Durable close skipped"));
    assert!(!sink.contains("Restarting session at"));
    assert_eq!(controller.state(), SessionState::Connected);
}
