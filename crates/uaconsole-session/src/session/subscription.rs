// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Data-change subscriptions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SubscriptionManager                      │
//! │  create / transfer / recreate / detach / delete              │
//! └──────────────────────────────────────────────────────────────┘
//!            │ SubscriptionHandle (logical identity, item set)
//!            ▼
//! ┌─────────────────────┐   FacadeEvent (tagged with channel)
//! │  Binding            │◄──────────────────────────────────────
//! │  channel, server id │            │
//! └─────────────────────┘            ▼
//!                          ┌──────────────────────┐
//!                          │  NotificationStream  │──► Notification
//!                          │  keep-alive watchdog │──► Escalation
//!                          └──────────────────────┘
//! ```
//!
//! A handle keeps its identity and monitored items for its whole life. Only
//! its binding (which channel and which server subscription it lives on)
//! changes, and it changes in one write so no two channels ever hold it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout_at, Instant};

use super::facade::{
    ChannelHandle, FacadeEvent, MonitoredItemRequest, ServerLimits, SessionFacade, SharedFacade,
    SubscriptionParameters,
};
use crate::config::SubscriptionDefaults;
use crate::error::{CapacityError, ConnectionError, SessionError, SessionResult, SubscriptionError};
use crate::output::OutputSink;
use crate::types::{NodeRef, StatusCode, UaValue};

// =============================================================================
// SubscriptionSpec
// =============================================================================

/// Immutable description of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    sampling_interval: Duration,
    publishing_interval: Duration,
    queue_size: u32,
    keep_alive_count: u32,
    lifetime_count: u32,
    nodes: Vec<NodeRef>,
}

impl SubscriptionSpec {
    /// Creates a builder with the default parameters.
    pub fn builder() -> SubscriptionSpecBuilder {
        SubscriptionSpecBuilder::default()
    }

    /// Creates a builder seeded from configured defaults.
    pub fn from_defaults(defaults: &SubscriptionDefaults) -> SubscriptionSpecBuilder {
        SubscriptionSpecBuilder {
            sampling_interval: defaults.sampling_interval,
            publishing_interval: defaults.publishing_interval,
            queue_size: defaults.queue_size,
            keep_alive_count: defaults.keep_alive_count,
            lifetime_count: defaults.lifetime_count,
            nodes: Vec::new(),
        }
    }

    /// Sampling interval of every monitored item.
    pub fn sampling_interval(&self) -> Duration {
        self.sampling_interval
    }

    /// Publishing interval.
    pub fn publishing_interval(&self) -> Duration {
        self.publishing_interval
    }

    /// Queue size of every monitored item.
    pub fn queue_size(&self) -> u32 {
        self.queue_size
    }

    /// Keep-alive count.
    pub fn keep_alive_count(&self) -> u32 {
        self.keep_alive_count
    }

    /// Lifetime count.
    pub fn lifetime_count(&self) -> u32 {
        self.lifetime_count
    }

    /// Nodes to monitor, in order, without duplicates.
    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    /// Silence after which the channel is considered failed.
    pub fn keep_alive_timeout(&self) -> Duration {
        self.publishing_interval * self.keep_alive_count
    }

    /// Server-side parameters.
    pub fn parameters(&self) -> SubscriptionParameters {
        SubscriptionParameters {
            publishing_interval: self.publishing_interval,
            lifetime_count: self.lifetime_count,
            keep_alive_count: self.keep_alive_count,
        }
    }
}

/// Builder for [`SubscriptionSpec`].
#[derive(Debug, Clone)]
pub struct SubscriptionSpecBuilder {
    sampling_interval: Duration,
    publishing_interval: Duration,
    queue_size: u32,
    keep_alive_count: u32,
    lifetime_count: u32,
    nodes: Vec<NodeRef>,
}

impl Default for SubscriptionSpecBuilder {
    fn default() -> Self {
        Self::from(&SubscriptionDefaults::default())
    }
}

impl From<&SubscriptionDefaults> for SubscriptionSpecBuilder {
    fn from(defaults: &SubscriptionDefaults) -> Self {
        SubscriptionSpec::from_defaults(defaults)
    }
}

impl SubscriptionSpecBuilder {
    /// Sets the sampling interval.
    pub fn sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Sets the publishing interval.
    pub fn publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }

    /// Sets the queue size.
    pub fn queue_size(mut self, size: u32) -> Self {
        self.queue_size = size;
        self
    }

    /// Sets the keep-alive count.
    pub fn keep_alive_count(mut self, count: u32) -> Self {
        self.keep_alive_count = count;
        self
    }

    /// Sets the lifetime count.
    pub fn lifetime_count(mut self, count: u32) -> Self {
        self.lifetime_count = count;
        self
    }

    /// Adds a node to monitor.
    pub fn add_node(mut self, node: NodeRef) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds several nodes to monitor.
    pub fn add_nodes(mut self, nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Validates and builds the spec.
    ///
    /// Repeated node ids are dropped; the first occurrence keeps its place.
    pub fn build(self) -> SessionResult<SubscriptionSpec> {
        if self.publishing_interval.is_zero() {
            return Err(SubscriptionError::invalid_spec("publishing interval must be greater than 0").into());
        }
        if self.keep_alive_count == 0 {
            return Err(SubscriptionError::invalid_spec("keep-alive count must be greater than 0").into());
        }
        if self.lifetime_count < self.keep_alive_count.saturating_mul(3) {
            return Err(SubscriptionError::invalid_spec(
                "lifetime count must be at least three times the keep-alive count",
            )
            .into());
        }
        if self.nodes.is_empty() {
            return Err(SubscriptionError::invalid_spec("no nodes to monitor").into());
        }

        let mut seen = HashSet::with_capacity(self.nodes.len());
        let nodes = self
            .nodes
            .into_iter()
            .filter(|n| seen.insert(n.node_id.clone()))
            .collect();

        Ok(SubscriptionSpec {
            sampling_interval: self.sampling_interval,
            publishing_interval: self.publishing_interval,
            queue_size: self.queue_size,
            keep_alive_count: self.keep_alive_count,
            lifetime_count: self.lifetime_count,
            nodes,
        })
    }
}

// =============================================================================
// Sampling
// =============================================================================

/// Variables eligible for the subscribe-all exercise: variables outside the
/// standard and server namespaces.
pub fn subscription_candidates(nodes: &[NodeRef]) -> Vec<NodeRef> {
    nodes
        .iter()
        .filter(|n| n.is_variable() && n.namespace_index() > 1)
        .cloned()
        .collect()
}

/// Draws at most `max` candidates uniformly at random.
///
/// The same seed and candidate list always give the same subset. The subset
/// keeps the candidates' relative order. When there are no more than `max`
/// candidates all of them are returned.
pub fn select_sample(candidates: &[NodeRef], max: usize, seed: u64) -> Vec<NodeRef> {
    if candidates.len() <= max {
        return candidates.to_vec();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, candidates.len(), max).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| candidates[i].clone()).collect()
}

// =============================================================================
// Identifiers and items
// =============================================================================

/// Session-local identity of a subscription.
///
/// Unlike the server identifier it survives transfer and re-creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One monitored item of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitoredItem {
    /// Client handle, 1-based and dense within the subscription.
    pub client_handle: u32,
    /// Monitored node.
    pub node: NodeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    channel: Option<ChannelHandle>,
    server_id: u32,
}

// =============================================================================
// SubscriptionHandle
// =============================================================================

/// Handle to a logical subscription.
///
/// Clones refer to the same subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    spec: Arc<SubscriptionSpec>,
    items: Arc<[MonitoredItem]>,
    binding: Arc<RwLock<Binding>>,
}

impl SubscriptionHandle {
    /// Local identity.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Spec the subscription was created from.
    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    /// Monitored items, ordered by client handle.
    pub fn monitored_items(&self) -> &[MonitoredItem] {
        &self.items
    }

    /// Item with the given client handle.
    pub fn item(&self, client_handle: u32) -> Option<&MonitoredItem> {
        let index = usize::try_from(client_handle).ok()?.checked_sub(1)?;
        self.items.get(index)
    }

    /// Channel the subscription is bound to; `None` while detached.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.binding.read().channel
    }

    /// Current server subscription identifier.
    pub fn server_id(&self) -> u32 {
        self.binding.read().server_id
    }

    /// Returns `true` while bound to a channel.
    pub fn is_bound(&self) -> bool {
        self.channel().is_some()
    }

    fn binding(&self) -> Binding {
        *self.binding.read()
    }

    fn bind(&self, channel: ChannelHandle, server_id: u32) {
        *self.binding.write() = Binding {
            channel: Some(channel),
            server_id,
        };
    }

    fn unbind(&self) {
        self.binding.write().channel = None;
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding();
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("items", &self.items.len())
            .field("channel", &binding.channel)
            .field("server_id", &binding.server_id)
            .finish()
    }
}

// =============================================================================
// Notification / Escalation
// =============================================================================

/// One value change.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Subscription that produced it.
    pub subscription: SubscriptionId,
    /// Node that changed.
    pub node: NodeRef,
    /// New value.
    pub value: Option<UaValue>,
    /// Status of the value.
    pub status: StatusCode,
    /// Source timestamp, or the time of arrival when the server sent none.
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}: {} = {} ({})", self.subscription, self.node.node_id, value, self.status),
            None => write!(f, "{}: {} = <no value> ({})", self.subscription, self.node.node_id, self.status),
        }
    }
}

/// Failure signalled from a notification stream to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// No data and no keep-alive within `keep_alive_count * publishing_interval`.
    KeepAliveTimeout {
        /// Silent subscription.
        subscription: SubscriptionId,
        /// Channel it was bound to.
        channel: ChannelHandle,
        /// Length of the silence.
        silence: Duration,
    },
}

// =============================================================================
// NotificationStream
// =============================================================================

/// Lazy, endless sequence of value changes of one subscription.
///
/// Obtained once per subscription from
/// [`SubscriptionManager::notifications_of`]. Events from any channel or
/// server subscription other than the current binding are dropped, so a
/// transfer in progress never yields stale notifications. While bound, the
/// stream also acts as keep-alive watchdog.
pub struct NotificationStream {
    handle: SubscriptionHandle,
    events: broadcast::Receiver<FacadeEvent>,
    escalations: mpsc::UnboundedSender<Escalation>,
    watched: Option<ChannelHandle>,
    last_signal: Instant,
}

impl NotificationStream {
    /// Subscription this stream belongs to.
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Waits for the next value change.
    ///
    /// Cancel safe: dropping the future loses no event.
    ///
    /// # Errors
    ///
    /// `ConnectionError::KeepAliveTimeout` after a silent keep-alive window
    /// (the escalation has already been sent), `ConnectionError::Closed`
    /// when the facade stops publishing events.
    pub async fn next(&mut self) -> SessionResult<Notification> {
        let window = self.handle.spec.keep_alive_timeout();

        loop {
            let binding = self.handle.binding();
            if binding.channel != self.watched {
                self.watched = binding.channel;
                self.last_signal = Instant::now();
            }

            let received = match binding.channel {
                Some(_) => match timeout_at(self.last_signal + window, self.events.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Err(self.escalate(window)),
                },
                None => self.events.recv().await,
            };

            let event = match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        subscription = %self.handle.id,
                        skipped,
                        "Notification stream lagged behind"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ConnectionError::closed("facade event stream ended").into());
                }
            };

            // Re-read: the binding may have moved while we were waiting.
            let binding = self.handle.binding();
            let current = binding.channel.is_some_and(|c| c == event.channel())
                && event.subscription_id() == Some(binding.server_id);
            if !current {
                continue;
            }

            match event {
                FacadeEvent::DataChange {
                    client_handle,
                    value,
                    ..
                } => {
                    self.last_signal = Instant::now();
                    let Some(item) = self.handle.item(client_handle) else {
                        tracing::debug!(client_handle, "Data change for unknown client handle");
                        continue;
                    };
                    return Ok(Notification {
                        subscription: self.handle.id,
                        node: item.node.clone(),
                        timestamp: value.source_timestamp.unwrap_or_else(Utc::now),
                        value: value.value,
                        status: value.status,
                    });
                }
                FacadeEvent::KeepAlive { .. } => {
                    self.last_signal = Instant::now();
                }
                FacadeEvent::ChannelDown { .. } => {}
            }
        }
    }

    fn escalate(&mut self, silence: Duration) -> SessionError {
        let channel = self.watched.unwrap_or(ChannelHandle(0));
        self.last_signal = Instant::now();

        tracing::warn!(
            subscription = %self.handle.id,
            channel = %channel,
            silence_ms = silence.as_millis() as u64,
            "Keep-alive timeout"
        );
        let _ = self.escalations.send(Escalation::KeepAliveTimeout {
            subscription: self.handle.id,
            channel,
            silence,
        });
        ConnectionError::keep_alive_timeout(self.handle.id, silence).into()
    }
}

impl fmt::Debug for NotificationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationStream")
            .field("subscription", &self.handle.id)
            .field("watched", &self.watched)
            .finish()
    }
}

// =============================================================================
// NotificationCallback
// =============================================================================

/// Receives every notification the controller pumps out of a stream.
#[async_trait]
pub trait NotificationCallback: Send + Sync {
    /// Called for each value change, in arrival order.
    async fn on_notification(&self, notification: Notification);
}

/// Forwards notifications into an mpsc channel.
pub struct ChannelCallback {
    sender: mpsc::Sender<Notification>,
}

impl ChannelCallback {
    /// Creates a callback feeding `sender`.
    pub fn new(sender: mpsc::Sender<Notification>) -> Self {
        Self { sender }
    }

    /// Creates a callback together with its receiver.
    pub fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl NotificationCallback for ChannelCallback {
    async fn on_notification(&self, notification: Notification) {
        let _ = self.sender.send(notification).await;
    }
}

/// Writes every notification to an output sink.
pub struct OutputCallback {
    output: Arc<dyn OutputSink>,
}

impl OutputCallback {
    /// Creates a callback writing to `output`.
    pub fn new(output: Arc<dyn OutputSink>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl NotificationCallback for OutputCallback {
    async fn on_notification(&self, notification: Notification) {
        self.output.write_line(&notification.to_string());
    }
}

// =============================================================================
// SubscriptionManager
// =============================================================================

/// Owns the subscriptions of one session.
///
/// At most one subscription is active per session.
pub struct SubscriptionManager<F: SessionFacade> {
    facade: Arc<SharedFacade<F>>,
    output: Arc<dyn OutputSink>,
    subscriptions: RwLock<HashMap<SubscriptionId, SubscriptionHandle>>,
    streams_taken: Mutex<HashSet<SubscriptionId>>,
    next_local_id: AtomicU64,
    escalation_tx: mpsc::UnboundedSender<Escalation>,
    escalation_rx: Mutex<Option<mpsc::UnboundedReceiver<Escalation>>>,
    stats: SubscriptionManagerStats,
}

impl<F: SessionFacade> SubscriptionManager<F> {
    /// Creates a manager over a shared facade.
    pub fn new(facade: Arc<SharedFacade<F>>, output: Arc<dyn OutputSink>) -> Self {
        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        Self {
            facade,
            output,
            subscriptions: RwLock::new(HashMap::new()),
            streams_taken: Mutex::new(HashSet::new()),
            next_local_id: AtomicU64::new(1),
            escalation_tx,
            escalation_rx: Mutex::new(Some(escalation_rx)),
            stats: SubscriptionManagerStats::default(),
        }
    }

    /// Takes the escalation receiver. Returns `None` after the first call.
    pub fn take_escalations(&self) -> Option<mpsc::UnboundedReceiver<Escalation>> {
        self.escalation_rx.lock().take()
    }

    /// Creates a subscription on `channel`.
    ///
    /// # Errors
    ///
    /// - `SubscriptionError::AlreadyActive` if a subscription exists
    /// - `CapacityError` if the item count exceeds server limits; nothing
    ///   is left behind on the server in that case
    pub async fn create_subscription(
        &self,
        channel: ChannelHandle,
        spec: SubscriptionSpec,
    ) -> SessionResult<SubscriptionHandle> {
        if let Some(existing) = self.active() {
            return Err(SubscriptionError::already_active(existing.id()).into());
        }

        let limits = self.facade.server_limits(channel).await?;
        let count = spec.nodes().len();
        let max = limits.max_monitored_items_per_subscription;
        if max != 0 && count > max {
            self.output.write_line(&format!(
                "Cannot subscribe to {count} variables, the server allows {max} per subscription."
            ));
            return Err(CapacityError::too_many_monitored_items(count, max).into());
        }

        let items: Arc<[MonitoredItem]> = spec
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, node)| MonitoredItem {
                client_handle: i as u32 + 1,
                node: node.clone(),
            })
            .collect();

        let server_id = self.install(channel, &spec, &items, &limits).await?;

        let handle = SubscriptionHandle {
            id: SubscriptionId(self.next_local_id.fetch_add(1, Ordering::Relaxed)),
            spec: Arc::new(spec),
            items,
            binding: Arc::new(RwLock::new(Binding {
                channel: Some(channel),
                server_id,
            })),
        };
        self.subscriptions.write().insert(handle.id, handle.clone());
        self.stats.created.fetch_add(1, Ordering::Relaxed);

        self.output.write_line(&format!(
            "Created subscription {} with {} monitored items on {channel}.",
            handle.id, count
        ));
        tracing::info!(
            subscription = %handle.id,
            subscription_id = server_id,
            channel = %channel,
            monitored_items = count,
            publishing_interval_ms = handle.spec.publishing_interval.as_millis() as u64,
            "Subscription created"
        );

        Ok(handle)
    }

    /// Creates the server subscription and its items; returns the server id.
    async fn install(
        &self,
        channel: ChannelHandle,
        spec: &SubscriptionSpec,
        items: &[MonitoredItem],
        limits: &ServerLimits,
    ) -> SessionResult<u32> {
        let server_id = self
            .facade
            .create_subscription(channel, &spec.parameters())
            .await?;

        let requests: Vec<MonitoredItemRequest> = items
            .iter()
            .map(|item| MonitoredItemRequest {
                client_handle: item.client_handle,
                node_id: item.node.node_id.clone(),
                sampling_interval: spec.sampling_interval,
                queue_size: spec.queue_size,
            })
            .collect();

        let per_call = ServerLimits::clamp(limits.max_monitored_items_per_call, requests.len()).max(1);
        let mut created = 0usize;
        let mut rejected = 0usize;

        for chunk in requests.chunks(per_call) {
            let results = match self
                .facade
                .create_monitored_items(channel, server_id, chunk)
                .await
            {
                Ok(results) => results,
                Err(e) => {
                    let _ = self.facade.delete_subscription(channel, server_id).await;
                    return Err(e);
                }
            };

            if results
                .iter()
                .any(|r| r.status == StatusCode::BAD_TOO_MANY_MONITORED_ITEMS)
            {
                let _ = self.facade.delete_subscription(channel, server_id).await;
                let max = match limits.max_monitored_items_per_subscription {
                    0 => created + results.iter().filter(|r| r.status.is_good()).count(),
                    advertised => advertised,
                };
                return Err(CapacityError::too_many_monitored_items(items.len(), max).into());
            }

            for result in &results {
                if result.status.is_bad() {
                    rejected += 1;
                    tracing::debug!(
                        client_handle = result.client_handle,
                        status = %result.status,
                        "Monitored item rejected"
                    );
                } else {
                    created += 1;
                }
            }
        }

        if rejected > 0 {
            self.output
                .write_line(&format!("{rejected} monitored items were rejected by the server."));
        }
        Ok(server_id)
    }

    /// Binds a persisted subscription to `channel` without touching its items.
    ///
    /// The handle is detached first, so no notification of the old channel
    /// is yielded while the transfer runs.
    ///
    /// # Errors
    ///
    /// `TransferError` when the server refuses; the handle stays detached.
    pub async fn transfer(&self, handle: &SubscriptionHandle, channel: ChannelHandle) -> SessionResult<()> {
        self.ensure_known(handle)?;
        handle.unbind();

        let server_id = handle.server_id();
        match self.facade.transfer_subscription(channel, server_id).await {
            Ok(()) => {
                handle.bind(channel, server_id);
                self.stats.transferred.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    subscription = %handle.id,
                    subscription_id = server_id,
                    channel = %channel,
                    "Subscription transferred"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.transfer_failures.fetch_add(1, Ordering::Relaxed);
                e.log("subscription transfer");
                Err(e)
            }
        }
    }

    /// Re-creates a subscription on `channel` from its spec.
    ///
    /// The handle keeps its identity and its monitored items, including
    /// their client handles; only the server identifier changes.
    pub async fn recreate(&self, handle: &SubscriptionHandle, channel: ChannelHandle) -> SessionResult<()> {
        self.ensure_known(handle)?;
        handle.unbind();

        let limits = self.facade.server_limits(channel).await?;
        let server_id = self.install(channel, &handle.spec, &handle.items, &limits).await?;
        handle.bind(channel, server_id);
        self.stats.recreated.fetch_add(1, Ordering::Relaxed);

        self.output.write_line(&format!(
            "Re-created subscription {} with {} monitored items on {channel}.",
            handle.id,
            handle.items.len()
        ));
        tracing::info!(
            subscription = %handle.id,
            subscription_id = server_id,
            channel = %channel,
            "Subscription re-created"
        );
        Ok(())
    }

    /// Marks a subscription as not bound to any channel.
    pub fn detach(&self, handle: &SubscriptionHandle) {
        handle.unbind();
        tracing::debug!(subscription = %handle.id, "Subscription detached");
    }

    /// Deletes a subscription.
    ///
    /// The local handle is always forgotten; a server failure is returned.
    pub async fn delete_subscription(&self, handle: &SubscriptionHandle) -> SessionResult<()> {
        self.subscriptions.write().remove(&handle.id);
        self.streams_taken.lock().remove(&handle.id);

        let binding = handle.binding();
        handle.unbind();
        match binding.channel {
            Some(channel) => {
                self.facade
                    .delete_subscription(channel, binding.server_id)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Hands out the notification stream of a subscription, once.
    pub fn notifications_of(&self, handle: &SubscriptionHandle) -> SessionResult<NotificationStream> {
        self.ensure_known(handle)?;
        if !self.streams_taken.lock().insert(handle.id) {
            return Err(SubscriptionError::stream_taken(handle.id).into());
        }

        Ok(NotificationStream {
            handle: handle.clone(),
            events: self.facade.events(),
            escalations: self.escalation_tx.clone(),
            watched: handle.channel(),
            last_signal: Instant::now(),
        })
    }

    /// The active subscription, if any.
    pub fn active(&self) -> Option<SubscriptionHandle> {
        self.subscriptions.read().values().next().cloned()
    }

    /// Number of subscriptions.
    pub fn active_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Statistics.
    pub fn stats(&self) -> &SubscriptionManagerStats {
        &self.stats
    }

    fn ensure_known(&self, handle: &SubscriptionHandle) -> SessionResult<()> {
        if self.subscriptions.read().contains_key(&handle.id) {
            Ok(())
        } else {
            Err(SubscriptionError::not_found(handle.id).into())
        }
    }
}

impl<F: SessionFacade> fmt::Debug for SubscriptionManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.active_count())
            .finish()
    }
}

// =============================================================================
// SubscriptionManagerStats
// =============================================================================

/// Counters of the subscription manager.
#[derive(Debug, Default)]
pub struct SubscriptionManagerStats {
    created: AtomicU64,
    transferred: AtomicU64,
    transfer_failures: AtomicU64,
    recreated: AtomicU64,
}

impl SubscriptionManagerStats {
    /// Subscriptions created.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Successful transfers.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Rejected transfers.
    pub fn transfer_failures(&self) -> u64 {
        self.transfer_failures.load(Ordering::Relaxed)
    }

    /// Re-creations after a rejected transfer.
    pub fn recreated(&self) -> u64 {
        self.recreated.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;
    use crate::sim::SimulatedServer;
    use crate::types::{EndpointTarget, NodeClass, NodeId};

    fn variable(ns: u16, name: &str) -> NodeRef {
        NodeRef::new(NodeId::string(ns, name), NodeClass::Variable, name)
    }

    fn candidates(n: usize) -> Vec<NodeRef> {
        (0..n).map(|i| variable(3, &format!("Var{i:04}"))).collect()
    }

    #[test]
    fn test_spec_validation() {
        assert!(SubscriptionSpec::builder().build().is_err());
        assert!(SubscriptionSpec::builder()
            .add_node(variable(2, "A"))
            .keep_alive_count(0)
            .build()
            .is_err());
        assert!(SubscriptionSpec::builder()
            .add_node(variable(2, "A"))
            .keep_alive_count(30)
            .lifetime_count(60)
            .build()
            .is_err());
    }

    #[test]
    fn test_spec_dedups_nodes_in_order() {
        let spec = SubscriptionSpec::builder()
            .add_nodes([variable(2, "A"), variable(2, "B"), variable(2, "A")])
            .build()
            .unwrap();
        let names: Vec<_> = spec.nodes().iter().map(|n| n.browse_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(spec.keep_alive_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_sample_is_exact_subset() {
        let all = candidates(2500);
        let picked = select_sample(&all, 1000, 62541);
        assert_eq!(picked.len(), 1000);

        let unique: HashSet<_> = picked.iter().map(|n| n.node_id.clone()).collect();
        assert_eq!(unique.len(), 1000);
        let pool: HashSet<_> = all.iter().map(|n| n.node_id.clone()).collect();
        assert!(unique.is_subset(&pool));
    }

    #[test]
    fn test_sample_is_deterministic() {
        let all = candidates(2500);
        assert_eq!(select_sample(&all, 1000, 7), select_sample(&all, 1000, 7));
        assert_ne!(select_sample(&all, 1000, 7), select_sample(&all, 1000, 8));
    }

    #[test]
    fn test_every_candidate_is_selectable() {
        let all = candidates(25);
        let mut hit = HashSet::new();
        for seed in 0..400 {
            for node in select_sample(&all, 10, seed) {
                hit.insert(node.node_id);
            }
        }
        assert_eq!(hit.len(), 25);
    }

    #[test]
    fn test_small_candidate_set_is_kept() {
        let all = candidates(5);
        assert_eq!(select_sample(&all, 1000, 1), all);
    }

    #[test]
    fn test_candidates_filter() {
        let nodes = vec![
            variable(0, "Std"),
            variable(1, "Server"),
            variable(2, "Vendor"),
            NodeRef::new(NodeId::string(3, "Folder"), NodeClass::Object, "Folder"),
        ];
        let picked = subscription_candidates(&nodes);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].browse_name, "Vendor");
    }

    async fn manager_on(server: &SimulatedServer) -> (SubscriptionManager<SimulatedServer>, ChannelHandle) {
        let facade = Arc::new(SharedFacade::new(server.clone()));
        let channel = facade
            .open(&EndpointTarget::new("opc.tcp://sim"), Duration::from_secs(1))
            .await
            .unwrap();
        (SubscriptionManager::new(facade, Arc::new(MemorySink::new())), channel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_active_subscription() {
        let server = SimulatedServer::new();
        let (manager, channel) = manager_on(&server).await;
        let nodes = server.plant_variables();

        let spec = SubscriptionSpec::builder().add_nodes(nodes.clone()).build().unwrap();
        manager.create_subscription(channel, spec.clone()).await.unwrap();

        let err = manager.create_subscription(channel, spec).await.unwrap_err();
        assert!(matches!(err, SessionError::Subscription(SubscriptionError::AlreadyActive { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_error_over_server_limit() {
        let server = SimulatedServer::with_plant_variables(50);
        server.set_limits(ServerLimits {
            max_monitored_items_per_subscription: 20,
            ..ServerLimits::default()
        });
        let (manager, channel) = manager_on(&server).await;

        let spec = SubscriptionSpec::builder()
            .add_nodes(server.plant_variables())
            .build()
            .unwrap();
        let err = manager.create_subscription(channel, spec).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capacity(CapacityError::TooManyMonitoredItems { count: 50, max: 20 })
        ));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(server.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_error_reports_accepted_count_when_limit_unadvertised() {
        let server = SimulatedServer::with_plant_variables(50);
        server.set_limits(ServerLimits {
            max_monitored_items_per_subscription: 20,
            ..ServerLimits::default()
        });
        server.hide_limits(true);
        let (manager, channel) = manager_on(&server).await;

        let spec = SubscriptionSpec::builder()
            .add_nodes(server.plant_variables())
            .build()
            .unwrap();
        let err = manager.create_subscription(channel, spec).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capacity(CapacityError::TooManyMonitoredItems { count: 50, max: 20 })
        ));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(server.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_is_handed_out_once() {
        let server = SimulatedServer::new();
        let (manager, channel) = manager_on(&server).await;
        let spec = SubscriptionSpec::builder()
            .add_nodes(server.plant_variables())
            .build()
            .unwrap();
        let handle = manager.create_subscription(channel, spec).await.unwrap();

        let mut stream = manager.notifications_of(&handle).unwrap();
        assert!(manager.notifications_of(&handle).is_err());

        let first = stream.next().await.unwrap();
        assert_eq!(first.subscription, handle.id());
        assert!(handle.item(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_escalates() {
        let server = SimulatedServer::new();
        let (manager, channel) = manager_on(&server).await;
        let mut escalations = manager.take_escalations().unwrap();
        let spec = SubscriptionSpec::builder()
            .add_nodes(server.plant_variables())
            .build()
            .unwrap();
        let handle = manager.create_subscription(channel, spec).await.unwrap();
        let mut stream = manager.notifications_of(&handle).unwrap();

        server.pause_publishing(true);
        let started = Instant::now();
        let err = loop {
            if let Err(e) = stream.next().await {
                break e;
            }
        };
        assert!(matches!(
            err,
            SessionError::Connection(ConnectionError::KeepAliveTimeout { .. })
        ));
        assert!(started.elapsed() <= handle.spec().keep_alive_timeout() + Duration::from_secs(1));
        assert!(matches!(
            escalations.try_recv(),
            Ok(Escalation::KeepAliveTimeout { .. })
        ));
    }
}
