// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session lifecycle controller.
//!
//! # Lifecycle
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──► Connected ◄─────────────────────┐
//!                                             │    │                        │
//!                            channel lost /   │    │ close checkpoint       │
//!                            keep-alive miss  ▼    ▼                        │
//!                                   Reconnecting  ClosedAwaitingTransfer    │
//!                                     │   │         │ restart checkpoint    │
//!                      N failures     │   │         ▼                       │
//!                  FatallyFailed ◄────┘   │       Transferring ──transfer───┤
//!                                         │         │ rejected              │
//!                                         │         ▼                       │
//!                                         │       Connecting ──re-subscribe─┘
//!                                         └─────────────────────────────────┘
//! ```
//!
//! Every state change goes through [`StateMachine::transition`], which writes
//! it to the output sink and to the log.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::facade::{ChannelHandle, FacadeEvent, SessionFacade, SharedFacade};
use super::operations::{CallOutcome, OneShot, ReadOutcome, WriteOutcome};
use super::quit::QuitSignal;
use super::state::{
    SessionEvent, SessionState, StateMachine, StateTransition, TerminationReason, WaitBudget,
};
use super::subscription::{
    Escalation, NotificationCallback, NotificationStream, SubscriptionHandle, SubscriptionManager,
    SubscriptionSpec,
};
use crate::config::ClientConfig;
use crate::error::{FatalError, SessionError, SessionResult, SubscriptionError, TimeoutError};
use crate::output::OutputSink;
use crate::types::{EndpointTarget, NodeId, NodeRef, UaValue};
use crate::walker::{AddressSpaceWalker, BrowseStrategy, WalkResult};

// =============================================================================
// ReconnectReport
// =============================================================================

/// Outcome of one reconnect sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectReport {
    /// Attempts made, the successful one included.
    pub attempts: u32,
    /// Backoff delays waited between attempts.
    pub delays: Vec<Duration>,
    /// Channel the session ended up on.
    pub channel: Option<ChannelHandle>,
}

// =============================================================================
// DurableProgress
// =============================================================================

/// Checkpoint bookkeeping of one durable monitoring phase.
#[derive(Debug, Default)]
struct DurableProgress {
    closed: bool,
    restarted: bool,
    quiet_intervals: u64,
}

// =============================================================================
// PhaseGuard
// =============================================================================

/// Quit signal and time budget of the running monitoring phase.
///
/// Recovery steps consult it before every attempt and while backing off, so
/// a quit or an elapsed deadline is seen within one poll interval even in
/// the middle of a reconnect sequence.
#[derive(Clone, Copy)]
struct PhaseGuard<'a> {
    quit: &'a QuitSignal,
    budget: &'a WaitBudget,
}

impl PhaseGuard<'_> {
    fn interrupted(&self) -> Option<TerminationReason> {
        if self.quit.is_raised() {
            Some(TerminationReason::QuitRequested)
        } else if self.budget.is_exhausted() {
            Some(TerminationReason::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Waits `delay` in slices of at most one poll interval, never past the
    /// deadline.
    async fn backoff(&self, delay: Duration) -> Option<TerminationReason> {
        let wake = Instant::now() + delay;
        loop {
            let mut slice_end = wake.min(Instant::now() + self.budget.poll_interval());
            if let Some(deadline) = self.budget.deadline_at() {
                slice_end = slice_end.min(deadline);
            }
            tokio::time::sleep_until(slice_end).await;

            if let Some(reason) = self.interrupted() {
                return Some(reason);
            }
            if Instant::now() >= wake {
                return None;
            }
        }
    }
}

/// How a recovery step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// The session is connected again.
    Restored,
    /// The phase ended before the session was restored.
    Interrupted(TerminationReason),
}

// =============================================================================
// SessionLifecycleController
// =============================================================================

/// Owns one logical session: its channel, its state, its subscription.
///
/// All methods take `&self`; share the controller in an `Arc` to run one-shot
/// requests while [`monitor_until`](Self::monitor_until) is running.
pub struct SessionLifecycleController<F: SessionFacade> {
    facade: Arc<SharedFacade<F>>,
    config: ClientConfig,
    output: Arc<dyn OutputSink>,
    state: StateMachine,
    channel: RwLock<Option<ChannelHandle>>,
    endpoint: RwLock<Option<EndpointTarget>>,
    subscriptions: Arc<SubscriptionManager<F>>,
    operations: OneShot<F>,
    walker: AddressSpaceWalker<F>,
    escalations: Mutex<mpsc::UnboundedReceiver<Escalation>>,
    facade_events: Mutex<broadcast::Receiver<FacadeEvent>>,
    stream: Mutex<Option<NotificationStream>>,
    callback: RwLock<Option<Arc<dyn NotificationCallback>>>,
    last_reconnect: RwLock<Option<ReconnectReport>>,
    stats: ControllerStats,
}

impl<F: SessionFacade> SessionLifecycleController<F> {
    /// Creates a controller over `facade`.
    pub fn new(facade: F, config: ClientConfig, output: Arc<dyn OutputSink>) -> Self {
        Self::with_shared(Arc::new(SharedFacade::new(facade)), config, output)
    }

    /// Creates a controller over an already shared facade.
    pub fn with_shared(facade: Arc<SharedFacade<F>>, config: ClientConfig, output: Arc<dyn OutputSink>) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&facade), Arc::clone(&output)));
        let escalations = subscriptions
            .take_escalations()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        let facade_events = facade.events();

        Self {
            operations: OneShot::new(Arc::clone(&facade)),
            walker: AddressSpaceWalker::new(Arc::clone(&facade), Arc::clone(&output)),
            state: StateMachine::new(Arc::clone(&output)),
            channel: RwLock::new(None),
            endpoint: RwLock::new(None),
            subscriptions,
            escalations: Mutex::new(escalations),
            facade_events: Mutex::new(facade_events),
            stream: Mutex::new(None),
            callback: RwLock::new(None),
            last_reconnect: RwLock::new(None),
            stats: ControllerStats::default(),
            facade,
            config,
            output,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Every transition so far.
    pub fn history(&self) -> Vec<StateTransition> {
        self.state.history()
    }

    /// Current channel, `None` while not connected.
    pub fn channel(&self) -> Option<ChannelHandle> {
        *self.channel.read()
    }

    /// Configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The shared facade.
    pub fn facade(&self) -> &Arc<SharedFacade<F>> {
        &self.facade
    }

    /// The subscription manager.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager<F>> {
        &self.subscriptions
    }

    /// Statistics.
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Report of the most recent reconnect sequence.
    pub fn last_reconnect(&self) -> Option<ReconnectReport> {
        self.last_reconnect.read().clone()
    }

    /// Receives every notification pumped by the monitoring loop.
    pub fn set_notification_callback(&self, callback: Arc<dyn NotificationCallback>) {
        *self.callback.write() = Some(callback);
    }

    fn require_channel(&self) -> SessionResult<ChannelHandle> {
        self.channel().ok_or_else(SessionError::not_connected)
    }

    // =========================================================================
    // Connect / Disconnect
    // =========================================================================

    /// Opens a channel to `target`.
    ///
    /// # Errors
    ///
    /// `ConnectionError` on handshake or transport failure, `TimeoutError`
    /// when the endpoint does not answer within the connect timeout. The
    /// session is back in `Disconnected` in both cases.
    pub async fn connect(&self, target: EndpointTarget) -> SessionResult<SessionState> {
        target.validate()?;
        self.state.transition(
            SessionState::Connecting,
            SessionEvent::ConnectRequested {
                endpoint: target.url().to_string(),
            },
        )?;
        *self.endpoint.write() = Some(target.clone());

        match self.open_bounded(&target, self.config.connect_timeout).await {
            Ok(channel) => {
                *self.channel.write() = Some(channel);
                self.stats.connects.fetch_add(1, Ordering::Relaxed);
                self.state.transition(
                    SessionState::Connected,
                    SessionEvent::ChannelOpened {
                        channel: channel.to_string(),
                    },
                )?;
                tracing::info!(
                    endpoint = target.url(),
                    channel = %channel,
                    security = %target.security_mode(),
                    "Connected"
                );
                Ok(SessionState::Connected)
            }
            Err(e) => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                e.log("connect");
                self.output.write_line(&format!("Could not connect to server: {e}"));
                self.state.transition(
                    SessionState::Disconnected,
                    SessionEvent::OpenFailed { reason: e.to_string() },
                )?;
                Err(e)
            }
        }
    }

    /// Releases the channel and ends the session.
    ///
    /// Safe to call any number of times and in any state.
    pub async fn disconnect(&self) -> SessionResult<()> {
        if let Some(handle) = self.subscriptions.active() {
            if let Err(e) = self.subscriptions.delete_subscription(&handle).await {
                e.log("disconnect");
            }
        }

        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = self.facade.close(channel, false).await {
                e.log("disconnect");
            }
        }

        if self.state.current().is_terminal() {
            tracing::debug!(state = %self.state.current(), "Disconnect on finished session");
            return Ok(());
        }
        self.state
            .transition(SessionState::Closed, SessionEvent::DisconnectRequested)?;
        Ok(())
    }

    async fn open_bounded(&self, target: &EndpointTarget, timeout: Duration) -> SessionResult<ChannelHandle> {
        match tokio::time::timeout(timeout, self.facade.open(target, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TimeoutError::connection(target.url(), timeout).into()),
        }
    }

    /// Opens on the primary endpoint, then on the fallback endpoint.
    async fn open_with_fallback(&self, timeout: Duration) -> SessionResult<ChannelHandle> {
        let primary = self
            .endpoint
            .read()
            .clone()
            .ok_or_else(SessionError::not_connected)?;

        let primary_error = match self.open_bounded(&primary, timeout).await {
            Ok(channel) => return Ok(channel),
            Err(e) => e,
        };

        match &self.config.monitor.fallback_endpoint {
            Some(fallback) => {
                tracing::info!(
                    primary = primary.url(),
                    fallback = fallback.url(),
                    error = %primary_error,
                    "Primary endpoint unavailable, trying fallback"
                );
                self.open_bounded(fallback, timeout).await
            }
            None => Err(primary_error),
        }
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Walks the address space below `root`.
    pub async fn browse(&self, root: &NodeId, strategy: BrowseStrategy) -> SessionResult<WalkResult> {
        let channel = self.require_channel()?;
        self.walker.walk(channel, root, strategy).await
    }

    /// Reads values; one outcome per node.
    pub async fn read_values(&self, nodes: &[NodeRef]) -> Vec<ReadOutcome> {
        self.operations.read_values(self.channel(), nodes).await
    }

    /// Writes values; one outcome per pair.
    pub async fn write_values(&self, writes: &[(NodeRef, UaValue)]) -> Vec<WriteOutcome> {
        self.operations.write_values(self.channel(), writes).await
    }

    /// Calls a method.
    pub async fn call_method(&self, object: &NodeRef, method: &NodeRef, args: &[UaValue]) -> CallOutcome {
        self.operations.call_method(self.channel(), object, method, args).await
    }

    /// Creates the session's subscription and arms its notification stream.
    ///
    /// The stream is pumped by [`monitor_until`](Self::monitor_until), which
    /// holds it for the whole monitoring phase. Subscribe before monitoring.
    ///
    /// # Errors
    ///
    /// `SubscriptionError::MonitoringActive` while a monitoring phase runs;
    /// nothing is created on the server in that case.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> SessionResult<SubscriptionHandle> {
        let channel = self.require_channel()?;
        let mut slot = self
            .stream
            .try_lock()
            .map_err(|_| SubscriptionError::monitoring_active())?;
        let handle = self.subscriptions.create_subscription(channel, spec).await?;
        *slot = Some(self.subscriptions.notifications_of(&handle)?);
        Ok(handle)
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Monitors with the configured deadline.
    pub async fn monitor(&self, quit: &QuitSignal) -> SessionResult<TerminationReason> {
        self.monitor_until(quit, self.config.monitor.deadline).await
    }

    /// Keeps the session alive until `quit` is raised or `deadline` elapses.
    ///
    /// Polls every `poll_interval`. Each tick checks, in order: the quit
    /// signal, the deadline, channel health (reconnecting when needed) and,
    /// in durable mode, the close and restart checkpoints. Notifications are
    /// pumped to the callback between ticks. Reconnect backoff waits in
    /// poll-interval slices and re-checks quit and the deadline after each.
    ///
    /// A session failure ends monitoring with
    /// [`TerminationReason::FatalError`] after it was written to the output.
    ///
    /// # Errors
    ///
    /// `ConnectionError::NotConnected` if the session is not connected.
    pub async fn monitor_until(
        &self,
        quit: &QuitSignal,
        deadline: Option<Duration>,
    ) -> SessionResult<TerminationReason> {
        match self.state.current() {
            SessionState::FatallyFailed => return Ok(TerminationReason::FatalError),
            SessionState::Connected => {}
            _ => return Err(SessionError::not_connected()),
        }

        let poll = self.config.monitor.poll_interval;
        let mut budget = WaitBudget::start(deadline, poll);
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut durable = DurableProgress::default();

        let mut stream = self.stream.lock().await;
        let mut pumping = stream.is_some();
        let callback = self.callback.read().clone();

        tracing::info!(
            deadline_ms = deadline.map(|d| d.as_millis() as u64),
            poll_ms = poll.as_millis() as u64,
            durable = self.config.monitor.is_durable(),
            "Monitoring started"
        );

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    budget.tick();
                    let guard = PhaseGuard { quit, budget: &budget };
                    if let Some(reason) = self.on_tick(guard, &mut durable).await {
                        break reason;
                    }
                }
                received = next_notification(&mut stream), if pumping => match received {
                    Ok(notification) => {
                        self.stats.notifications.fetch_add(1, Ordering::Relaxed);
                        if let Some(callback) = &callback {
                            callback.on_notification(notification).await;
                        }
                    }
                    Err(SessionError::Connection(crate::error::ConnectionError::KeepAliveTimeout { .. })) => {
                        self.stats.keep_alive_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        e.log("notification stream");
                        pumping = false;
                    }
                },
            }
        };

        self.output.write_line(&format!(
            "Monitoring ended: {reason} after {}.",
            humantime::format_duration(Duration::from_secs(budget.elapsed().as_secs()))
        ));
        tracing::info!(
            reason = %reason,
            elapsed_ms = budget.elapsed().as_millis() as u64,
            ticks = budget.ticks(),
            "Monitoring ended"
        );
        Ok(reason)
    }

    async fn on_tick(&self, guard: PhaseGuard<'_>, durable: &mut DurableProgress) -> Option<TerminationReason> {
        if let Some(reason) = guard.interrupted() {
            return Some(reason);
        }

        if let Some(reason) = self.channel_lost().await {
            match self.recover(reason, guard).await {
                Ok(Recovery::Restored) => {}
                Ok(Recovery::Interrupted(reason)) => return Some(reason),
                Err(e) if e.is_fatal() => return Some(TerminationReason::FatalError),
                Err(e) => e.log("recover"),
            }
        }
        if self.state.current() == SessionState::FatallyFailed {
            return Some(TerminationReason::FatalError);
        }

        if let Some(schedule) = &self.config.monitor.durable {
            let elapsed = guard.budget.elapsed();
            if !durable.closed && elapsed >= schedule.close_after {
                durable.closed = true;
                match self.close_for_transfer().await {
                    Ok(true) => {}
                    Ok(false) => durable.restarted = true,
                    Err(e) => {
                        e.log("durable close");
                        durable.restarted = true;
                    }
                }
            } else if durable.closed && !durable.restarted && elapsed >= schedule.restart_after {
                durable.restarted = true;
                match self.durable_restart(guard).await {
                    Ok(Recovery::Restored) => {}
                    Ok(Recovery::Interrupted(reason)) => return Some(reason),
                    Err(e) if e.is_fatal() => return Some(TerminationReason::FatalError),
                    Err(e) => e.log("durable restart"),
                }
            } else if durable.closed && !durable.restarted {
                self.output
                    .write_line(&format!("No communication interval {}", durable.quiet_intervals));
                durable.quiet_intervals += 1;
            }
        }

        None
    }

    /// Drains liveness signals; returns a reason if the current channel failed.
    async fn channel_lost(&self) -> Option<String> {
        let current = self.channel()?;
        if self.state.current() != SessionState::Connected {
            return None;
        }
        let mut lost = None;

        {
            let mut events = self.facade_events.lock().await;
            loop {
                match events.try_recv() {
                    Ok(FacadeEvent::ChannelDown { channel, reason }) if channel == current => {
                        lost.get_or_insert(reason);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Controller lagged behind facade events");
                    }
                    Err(_) => break,
                }
            }
        }

        let mut escalations = self.escalations.lock().await;
        while let Ok(escalation) = escalations.try_recv() {
            match escalation {
                Escalation::KeepAliveTimeout {
                    subscription,
                    channel,
                    silence,
                } if channel == current => {
                    lost.get_or_insert_with(|| {
                        format!(
                            "no keep-alive from {subscription} for {}",
                            humantime::format_duration(silence)
                        )
                    });
                }
                Escalation::KeepAliveTimeout { .. } => {}
            }
        }

        lost
    }

    // =========================================================================
    // Reconnect
    // =========================================================================

    /// Handles an unsolicited channel loss.
    async fn recover(&self, reason: String, guard: PhaseGuard<'_>) -> SessionResult<Recovery> {
        let lost = self.channel.write().take();
        if let Some(handle) = self.subscriptions.active() {
            self.subscriptions.detach(&handle);
        }
        if let Some(channel) = lost {
            if let Err(e) = self.facade.close(channel, true).await {
                e.log("close lost channel");
            }
        }

        self.output.write_line(&format!("Connection lost: {reason}"));
        self.state
            .transition(SessionState::Reconnecting, SessionEvent::ChannelLost { reason })?;
        self.reconnect(guard).await
    }

    /// Reconnects with exponential backoff. Must be called in `Reconnecting`.
    ///
    /// Stops early, leaving the session in `Reconnecting`, once `guard`
    /// reports a quit or an elapsed deadline.
    ///
    /// # Errors
    ///
    /// `FatalError::RetriesExhausted` after `max_attempts` consecutive
    /// failures, or at once when a failure is not retryable. The session is
    /// `FatallyFailed` afterwards.
    async fn reconnect(&self, guard: PhaseGuard<'_>) -> SessionResult<Recovery> {
        let policy = self.config.reconnect.clone();
        let mut report = ReconnectReport::default();
        let mut last_error: Option<SessionError> = None;

        for attempt in 1..=policy.max_attempts {
            if let Some(reason) = guard.interrupted() {
                return Ok(self.reconnect_interrupted(report, reason));
            }
            report.attempts = attempt;
            self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);

            match self.open_with_fallback(policy.attempt_timeout).await {
                Ok(channel) => {
                    *self.channel.write() = Some(channel);
                    self.restore_subscription(channel).await;
                    self.state.transition(
                        SessionState::Connected,
                        SessionEvent::ChannelOpened {
                            channel: channel.to_string(),
                        },
                    )?;
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.output
                        .write_line(&format!("Reconnected on {channel} after {attempt} attempt(s)."));
                    tracing::info!(channel = %channel, attempts = attempt, "Reconnected");

                    report.channel = Some(channel);
                    *self.last_reconnect.write() = Some(report);
                    return Ok(Recovery::Restored);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < policy.max_attempts {
                        let delay = policy.delay_for_attempt(attempt);
                        report.delays.push(delay);
                        self.output.write_line(&format!(
                            "Reconnect attempt {attempt} failed, retrying in {}.",
                            humantime::format_duration(delay)
                        ));
                        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect backoff");
                        if let Some(reason) = guard.backoff(delay).await {
                            return Ok(self.reconnect_interrupted(report, reason));
                        }
                    }
                }
            }
        }

        *self.last_reconnect.write() = Some(report.clone());
        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.state.transition(
            SessionState::FatallyFailed,
            SessionEvent::RetriesExhausted {
                attempts: report.attempts,
            },
        )?;

        let error = SessionError::from(FatalError::retries_exhausted(report.attempts, last));
        self.output
            .write_line(&format!("Session failed [{}]: {error}", error.error_code()));
        error.log("reconnect");
        Err(error)
    }

    fn reconnect_interrupted(&self, report: ReconnectReport, reason: TerminationReason) -> Recovery {
        self.output.write_line(&format!(
            "Reconnect stopped after {} attempt(s): {reason}.",
            report.attempts
        ));
        tracing::info!(attempts = report.attempts, reason = %reason, "Reconnect interrupted");
        *self.last_reconnect.write() = Some(report);
        Recovery::Interrupted(reason)
    }

    /// Moves the active subscription to `channel`, re-creating it if the
    /// server refuses the transfer.
    async fn restore_subscription(&self, channel: ChannelHandle) {
        let Some(handle) = self.subscriptions.active() else {
            return;
        };

        match self.subscriptions.transfer(&handle, channel).await {
            Ok(()) => {
                self.stats.transfers.fetch_add(1, Ordering::Relaxed);
                self.output
                    .write_line(&format!("Subscription {} transferred to {channel}.", handle.id()));
            }
            Err(e) => {
                self.stats.transfer_failures.fetch_add(1, Ordering::Relaxed);
                self.output.write_line(&format!(
                    "Transfer of subscription {} failed: {e}. Re-creating it.",
                    handle.id()
                ));
                if let Err(e) = self.subscriptions.recreate(&handle, channel).await {
                    e.log("re-create subscription");
                    self.output
                        .write_line(&format!("Could not re-create subscription {}: {e}", handle.id()));
                }
            }
        }
    }

    // =========================================================================
    // Durable transfer
    // =========================================================================

    /// Closes the channel but leaves the subscription on the server.
    ///
    /// Returns `false` without touching the session unless exactly one
    /// subscription is active.
    async fn close_for_transfer(&self) -> SessionResult<bool> {
        let active = self.subscriptions.active_count();
        if active != 1 {
            self.output.write_line(&format!(
                "Durable close skipped: {active} active subscriptions, expected 1."
            ));
            tracing::warn!(active, "Durable close skipped");
            return Ok(false);
        }

        let channel = self.require_channel()?;
        self.output.write_line(&format!(
            "Closing session at {}",
            Local::now().format("%H:%M:%S%.3f")
        ));

        if let Some(handle) = self.subscriptions.active() {
            self.subscriptions.detach(&handle);
        }
        *self.channel.write() = None;
        if let Err(e) = self.facade.close(channel, true).await {
            e.log("durable close");
        }
        self.state
            .transition(SessionState::ClosedAwaitingTransfer, SessionEvent::CloseCheckpoint)?;
        Ok(true)
    }

    /// Opens a new channel and transfers the persisted subscription to it.
    ///
    /// A rejected transfer falls back to a fresh connect and re-subscribe.
    async fn durable_restart(&self, guard: PhaseGuard<'_>) -> SessionResult<Recovery> {
        self.output.write_line(&format!(
            "Restarting session at {}",
            Local::now().format("%H:%M:%S%.3f")
        ));
        self.state
            .transition(SessionState::Transferring, SessionEvent::RestartCheckpoint)?;

        let channel = match self.open_with_fallback(self.config.connect_timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                e.log("durable restart");
                self.state.transition(
                    SessionState::Reconnecting,
                    SessionEvent::ChannelLost { reason: e.to_string() },
                )?;
                return self.reconnect(guard).await;
            }
        };
        *self.channel.write() = Some(channel);

        let Some(handle) = self.subscriptions.active() else {
            self.state.transition(
                SessionState::Connected,
                SessionEvent::ChannelOpened {
                    channel: channel.to_string(),
                },
            )?;
            return Ok(Recovery::Restored);
        };

        match self.subscriptions.transfer(&handle, channel).await {
            Ok(()) => {
                self.stats.transfers.fetch_add(1, Ordering::Relaxed);
                self.output
                    .write_line(&format!("Subscription {} transferred to {channel}.", handle.id()));
                self.state.transition(
                    SessionState::Connected,
                    SessionEvent::TransferSucceeded {
                        channel: channel.to_string(),
                    },
                )?;
                Ok(Recovery::Restored)
            }
            Err(e) => {
                self.stats.transfer_failures.fetch_add(1, Ordering::Relaxed);
                self.output
                    .write_line(&format!("Transfer failed: {e}. Re-creating the subscription."));
                self.state.transition(
                    SessionState::Connecting,
                    SessionEvent::TransferRejected { reason: e.to_string() },
                )?;
                self.fresh_connect(channel, &handle, guard).await
            }
        }
    }

    /// Replaces `stale` with a fresh channel and re-creates the subscription.
    async fn fresh_connect(
        &self,
        stale: ChannelHandle,
        handle: &SubscriptionHandle,
        guard: PhaseGuard<'_>,
    ) -> SessionResult<Recovery> {
        *self.channel.write() = None;
        if let Err(e) = self.facade.close(stale, false).await {
            e.log("close before fresh connect");
        }

        match self.open_with_fallback(self.config.connect_timeout).await {
            Ok(channel) => {
                *self.channel.write() = Some(channel);
                self.stats.connects.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.subscriptions.recreate(handle, channel).await {
                    e.log("re-subscribe");
                    self.output
                        .write_line(&format!("Could not re-create subscription {}: {e}", handle.id()));
                }
                self.state.transition(
                    SessionState::Connected,
                    SessionEvent::ChannelOpened {
                        channel: channel.to_string(),
                    },
                )?;
                Ok(Recovery::Restored)
            }
            Err(e) => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.state.transition(
                    SessionState::Reconnecting,
                    SessionEvent::OpenFailed { reason: e.to_string() },
                )?;
                self.reconnect(guard).await
            }
        }
    }
}

impl<F: SessionFacade> fmt::Debug for SessionLifecycleController<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLifecycleController")
            .field("facade", &self.facade.display_name())
            .field("state", &self.state.current())
            .field("channel", &self.channel())
            .field("subscriptions", &self.subscriptions.active_count())
            .finish()
    }
}

async fn next_notification(
    stream: &mut Option<NotificationStream>,
) -> SessionResult<super::subscription::Notification> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// ControllerStats
// =============================================================================

/// Counters of one controller.
#[derive(Debug, Default)]
pub struct ControllerStats {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    transfers: AtomicU64,
    transfer_failures: AtomicU64,
    notifications: AtomicU64,
    keep_alive_timeouts: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatsSnapshot {
    /// Successful connects, fresh connects after a rejected transfer included.
    pub connects: u64,
    /// Failed connects.
    pub connect_failures: u64,
    /// Reconnect attempts.
    pub reconnect_attempts: u64,
    /// Successful reconnects.
    pub reconnects: u64,
    /// Successful subscription transfers.
    pub transfers: u64,
    /// Rejected subscription transfers.
    pub transfer_failures: u64,
    /// Notifications pumped by the monitoring loop.
    pub notifications: u64,
    /// Keep-alive windows that passed in silence.
    pub keep_alive_timeouts: u64,
}

impl ControllerStats {
    /// Takes a snapshot.
    pub fn snapshot(&self) -> ControllerStatsSnapshot {
        ControllerStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            transfer_failures: self.transfer_failures.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            keep_alive_timeouts: self.keep_alive_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        for counter in [
            &self.connects,
            &self.connect_failures,
            &self.reconnect_attempts,
            &self.reconnects,
            &self.transfers,
            &self.transfer_failures,
            &self.notifications,
            &self.keep_alive_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::output::MemorySink;
    use crate::sim::SimulatedServer;

    const URL: &str = "opc.tcp://sim:4840";

    fn controller(server: &SimulatedServer) -> (SessionLifecycleController<SimulatedServer>, MemorySink) {
        let config = ClientConfig::builder()
            .endpoint(URL)
            .use_security(false)
            .build()
            .unwrap();
        let sink = MemorySink::new();
        (
            SessionLifecycleController::new(server.clone(), config, Arc::new(sink.clone())),
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect_idempotent() {
        let server = SimulatedServer::new();
        let (controller, sink) = controller(&server);

        let state = controller.connect(controller.config().endpoint.clone()).await.unwrap();
        assert_eq!(state, SessionState::Connected);
        assert_eq!(server.open_channel_count(), 1);

        controller.disconnect().await.unwrap();
        controller.disconnect().await.unwrap();
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(server.open_channel_count(), 0);
        assert!(sink.contains("Connected -> Closed (disconnect requested)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_returns_to_disconnected() {
        let server = SimulatedServer::new();
        server.fail_next_opens(1);
        let (controller, sink) = controller(&server);

        let err = controller
            .connect(controller.config().endpoint.clone())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(controller.state(), SessionState::Disconnected);
        assert!(sink.contains("Could not connect to server"));
        assert_eq!(controller.stats().snapshot().connect_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let server = SimulatedServer::new();
        server.set_open_delay(Duration::from_secs(60));
        let (controller, _) = controller(&server);

        let started = Instant::now();
        let err = controller
            .connect(controller.config().endpoint.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(started.elapsed() <= controller.config().connect_timeout + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_is_seen_at_next_tick() {
        let server = SimulatedServer::new();
        let (controller, _) = controller(&server);
        controller.connect(controller.config().endpoint.clone()).await.unwrap();

        let quit = QuitSignal::new();
        quit.raise();
        let started = Instant::now();
        let reason = controller.monitor_until(&quit, None).await.unwrap();
        assert_eq!(reason, TerminationReason::QuitRequested);
        assert!(started.elapsed() <= controller.config().monitor.poll_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_requires_connection() {
        let server = SimulatedServer::new();
        let (controller, _) = controller(&server);
        let err = controller
            .monitor_until(&QuitSignal::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), crate::types::StatusCode::BAD_NOT_CONNECTED);
    }

    #[test]
    fn test_stats_reset() {
        let stats = ControllerStats::default();
        stats.connects.fetch_add(2, Ordering::Relaxed);
        stats.notifications.fetch_add(9, Ordering::Relaxed);
        assert_eq!(stats.snapshot().notifications, 9);

        stats.reset();
        assert_eq!(stats.snapshot(), ControllerStatsSnapshot::default());
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
            ]
        );
    }
}
