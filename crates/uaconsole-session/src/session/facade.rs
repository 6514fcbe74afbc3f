// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The session capability consumed by every orchestration component.
//!
//! [`SessionFacade`] is the boundary to an external protocol stack. The
//! orchestration layer never talks to a stack directly; it goes through a
//! [`SharedFacade`], which adds the per-channel request gate so that at most
//! one request is in flight on any channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::error::SessionResult;
use crate::types::{DataValue, EndpointTarget, NodeClass, NodeId, NodeRef, StatusCode, UaValue};

// =============================================================================
// ChannelHandle
// =============================================================================

/// Opaque handle of an open channel.
///
/// Handles are never reused by a facade, so an event tagged with a handle
/// that is no longer current is always stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

// =============================================================================
// Browse types
// =============================================================================

/// One hierarchical reference returned by a browse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDescription {
    /// Target node.
    pub node_id: NodeId,
    /// Target browse name.
    pub browse_name: String,
    /// Target display name.
    pub display_name: String,
    /// Target node class.
    pub node_class: NodeClass,
    /// Target type definition.
    pub type_definition: Option<NodeId>,
}

impl ReferenceDescription {
    /// Converts the reference target into a [`NodeRef`].
    pub fn to_node_ref(&self) -> NodeRef {
        NodeRef {
            node_id: self.node_id.clone(),
            node_class: self.node_class,
            browse_name: self.browse_name.clone(),
            display_name: self.display_name.clone(),
            type_definition: self.type_definition.clone(),
            data_type: None,
        }
    }
}

/// Browse result for one parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseResponse {
    /// The browsed parent.
    pub parent: NodeId,
    /// Status of this parent's browse.
    pub status: StatusCode,
    /// Forward hierarchical references.
    pub references: Vec<ReferenceDescription>,
}

// =============================================================================
// Server limits
// =============================================================================

/// Operation limits advertised by the server. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Monitored items allowed in one subscription.
    pub max_monitored_items_per_subscription: usize,
    /// Monitored items allowed in one CreateMonitoredItems call.
    pub max_monitored_items_per_call: usize,
    /// Parents allowed in one Browse call.
    pub max_nodes_per_browse: usize,
    /// Nodes allowed in one Read or Write call.
    pub max_nodes_per_read: usize,
}

impl ServerLimits {
    /// Applies a limit to a requested size; zero limits are ignored.
    pub fn clamp(limit: usize, requested: usize) -> usize {
        if limit == 0 {
            requested
        } else {
            requested.min(limit)
        }
    }
}

// =============================================================================
// Subscription types
// =============================================================================

/// Server-side subscription parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionParameters {
    /// Publishing interval.
    pub publishing_interval: Duration,
    /// Lifetime count.
    pub lifetime_count: u32,
    /// Keep-alive count.
    pub keep_alive_count: u32,
}

/// Request to monitor the value of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredItemRequest {
    /// Client-assigned handle echoed in every notification.
    pub client_handle: u32,
    /// Node to monitor.
    pub node_id: NodeId,
    /// Sampling interval.
    pub sampling_interval: Duration,
    /// Queue size.
    pub queue_size: u32,
}

/// Result of creating one monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredItemResult {
    /// Client handle of the request.
    pub client_handle: u32,
    /// Status of this item.
    pub status: StatusCode,
    /// Server-assigned item identifier.
    pub server_item_id: u32,
}

// =============================================================================
// Call types
// =============================================================================

/// Result of a method call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    /// Overall status of the call.
    pub status: StatusCode,
    /// Output arguments.
    pub outputs: Vec<UaValue>,
    /// Per input argument status.
    pub input_argument_results: Vec<StatusCode>,
}

// =============================================================================
// FacadeEvent
// =============================================================================

/// Asynchronous notification from the facade.
///
/// Every event names the channel it originated on.
#[derive(Debug, Clone, PartialEq)]
pub enum FacadeEvent {
    /// The channel went down without being asked to.
    ChannelDown {
        /// Channel that failed.
        channel: ChannelHandle,
        /// Reason reported by the stack.
        reason: String,
    },

    /// A monitored item changed value.
    DataChange {
        /// Channel the publish response arrived on.
        channel: ChannelHandle,
        /// Server subscription identifier.
        subscription_id: u32,
        /// Client handle of the monitored item.
        client_handle: u32,
        /// New value.
        value: DataValue,
    },

    /// The subscription is alive but had nothing to report.
    KeepAlive {
        /// Channel the publish response arrived on.
        channel: ChannelHandle,
        /// Server subscription identifier.
        subscription_id: u32,
    },
}

impl FacadeEvent {
    /// Channel the event originated on.
    pub fn channel(&self) -> ChannelHandle {
        match self {
            Self::ChannelDown { channel, .. }
            | Self::DataChange { channel, .. }
            | Self::KeepAlive { channel, .. } => *channel,
        }
    }

    /// Server subscription the event belongs to, if any.
    pub fn subscription_id(&self) -> Option<u32> {
        match self {
            Self::DataChange {
                subscription_id, ..
            }
            | Self::KeepAlive {
                subscription_id, ..
            } => Some(*subscription_id),
            Self::ChannelDown { .. } => None,
        }
    }
}

// =============================================================================
// SessionFacade Trait
// =============================================================================

/// Capability interface of an external protocol stack.
///
/// One adapter exists per underlying transport. Implementations must be
/// cheap to share behind an `Arc`; all methods take `&self`.
#[async_trait]
pub trait SessionFacade: Send + Sync + 'static {
    // =========================================================================
    // Channel management
    // =========================================================================

    /// Opens a new channel.
    ///
    /// # Errors
    ///
    /// `ConnectionError` on handshake or transport failure, `TimeoutError`
    /// if the endpoint does not answer within `timeout`.
    async fn open(&self, target: &EndpointTarget, timeout: Duration) -> SessionResult<ChannelHandle>;

    /// Closes a channel.
    ///
    /// With `keep_subscriptions_alive` the server keeps the channel's
    /// subscriptions so that another channel can take them over.
    async fn close(&self, channel: ChannelHandle, keep_subscriptions_alive: bool) -> SessionResult<()>;

    // =========================================================================
    // Address space
    // =========================================================================

    /// Browses forward hierarchical references of every parent.
    ///
    /// One call is one round trip; the response has one entry per parent.
    async fn browse(&self, channel: ChannelHandle, parents: &[NodeId]) -> SessionResult<Vec<BrowseResponse>>;

    /// Returns the stack's node cache below `root`.
    async fn fetch_node_cache(&self, channel: ChannelHandle, root: &NodeId) -> SessionResult<Vec<NodeRef>>;

    // =========================================================================
    // One-shot services
    // =========================================================================

    /// Reads the value attribute of every node.
    async fn read(&self, channel: ChannelHandle, nodes: &[NodeId]) -> SessionResult<Vec<DataValue>>;

    /// Writes the value attribute of every node.
    async fn write(&self, channel: ChannelHandle, writes: &[(NodeId, UaValue)]) -> SessionResult<Vec<StatusCode>>;

    /// Calls a method on an object.
    async fn call(
        &self,
        channel: ChannelHandle,
        object: &NodeId,
        method: &NodeId,
        args: &[UaValue],
    ) -> SessionResult<CallResponse>;

    /// Returns the server's operation limits.
    async fn server_limits(&self, channel: ChannelHandle) -> SessionResult<ServerLimits>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates a subscription and returns its server identifier.
    async fn create_subscription(
        &self,
        channel: ChannelHandle,
        params: &SubscriptionParameters,
    ) -> SessionResult<u32>;

    /// Creates monitored items in a subscription.
    async fn create_monitored_items(
        &self,
        channel: ChannelHandle,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> SessionResult<Vec<MonitoredItemResult>>;

    /// Deletes a subscription.
    async fn delete_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()>;

    /// Binds an existing server subscription to `channel`.
    ///
    /// Monitored items are kept as they are.
    ///
    /// # Errors
    ///
    /// `TransferError` when the server refuses or no longer knows the
    /// subscription.
    async fn transfer_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()>;

    // =========================================================================
    // Notifications and metadata
    // =========================================================================

    /// Subscribes to facade events.
    fn events(&self) -> broadcast::Receiver<FacadeEvent>;

    /// Returns the facade display name for logging.
    fn display_name(&self) -> String;
}

// =============================================================================
// SharedFacade
// =============================================================================

/// A facade shared by all components of one session.
///
/// Every request that targets a channel first takes that channel's gate,
/// so requests on one channel never overlap while requests on different
/// channels (the old and the new one during a transfer) may.
pub struct SharedFacade<F: SessionFacade> {
    facade: Arc<F>,
    gates: parking_lot::Mutex<HashMap<ChannelHandle, Arc<Mutex<()>>>>,
}

impl<F: SessionFacade> SharedFacade<F> {
    /// Wraps a facade.
    pub fn new(facade: F) -> Self {
        Self::from_arc(Arc::new(facade))
    }

    /// Wraps an already shared facade.
    pub fn from_arc(facade: Arc<F>) -> Self {
        Self {
            facade,
            gates: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapped facade.
    pub fn inner(&self) -> &F {
        &self.facade
    }

    /// Waits until no other request is in flight on `channel`.
    pub async fn gate(&self, channel: ChannelHandle) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock();
            Arc::clone(gates.entry(channel).or_default())
        };
        gate.lock_owned().await
    }

    fn forget(&self, channel: ChannelHandle) {
        self.gates.lock().remove(&channel);
    }

    /// Opens a channel.
    pub async fn open(&self, target: &EndpointTarget, timeout: Duration) -> SessionResult<ChannelHandle> {
        self.facade.open(target, timeout).await
    }

    /// Closes a channel and drops its gate.
    pub async fn close(&self, channel: ChannelHandle, keep_subscriptions_alive: bool) -> SessionResult<()> {
        let result = {
            let _permit = self.gate(channel).await;
            self.facade.close(channel, keep_subscriptions_alive).await
        };
        self.forget(channel);
        result
    }

    /// Browses parents.
    pub async fn browse(&self, channel: ChannelHandle, parents: &[NodeId]) -> SessionResult<Vec<BrowseResponse>> {
        let _permit = self.gate(channel).await;
        self.facade.browse(channel, parents).await
    }

    /// Fetches the node cache.
    pub async fn fetch_node_cache(&self, channel: ChannelHandle, root: &NodeId) -> SessionResult<Vec<NodeRef>> {
        let _permit = self.gate(channel).await;
        self.facade.fetch_node_cache(channel, root).await
    }

    /// Reads values.
    pub async fn read(&self, channel: ChannelHandle, nodes: &[NodeId]) -> SessionResult<Vec<DataValue>> {
        let _permit = self.gate(channel).await;
        self.facade.read(channel, nodes).await
    }

    /// Writes values.
    pub async fn write(
        &self,
        channel: ChannelHandle,
        writes: &[(NodeId, UaValue)],
    ) -> SessionResult<Vec<StatusCode>> {
        let _permit = self.gate(channel).await;
        self.facade.write(channel, writes).await
    }

    /// Calls a method.
    pub async fn call(
        &self,
        channel: ChannelHandle,
        object: &NodeId,
        method: &NodeId,
        args: &[UaValue],
    ) -> SessionResult<CallResponse> {
        let _permit = self.gate(channel).await;
        self.facade.call(channel, object, method, args).await
    }

    /// Returns the server limits.
    pub async fn server_limits(&self, channel: ChannelHandle) -> SessionResult<ServerLimits> {
        let _permit = self.gate(channel).await;
        self.facade.server_limits(channel).await
    }

    /// Creates a subscription.
    pub async fn create_subscription(
        &self,
        channel: ChannelHandle,
        params: &SubscriptionParameters,
    ) -> SessionResult<u32> {
        let _permit = self.gate(channel).await;
        self.facade.create_subscription(channel, params).await
    }

    /// Creates monitored items.
    pub async fn create_monitored_items(
        &self,
        channel: ChannelHandle,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> SessionResult<Vec<MonitoredItemResult>> {
        let _permit = self.gate(channel).await;
        self.facade
            .create_monitored_items(channel, subscription_id, items)
            .await
    }

    /// Deletes a subscription.
    pub async fn delete_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()> {
        let _permit = self.gate(channel).await;
        self.facade.delete_subscription(channel, subscription_id).await
    }

    /// Transfers a subscription to `channel`.
    pub async fn transfer_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()> {
        let _permit = self.gate(channel).await;
        self.facade.transfer_subscription(channel, subscription_id).await
    }

    /// Subscribes to facade events.
    pub fn events(&self) -> broadcast::Receiver<FacadeEvent> {
        self.facade.events()
    }

    /// Facade display name.
    pub fn display_name(&self) -> String {
        self.facade.display_name()
    }
}

impl<F: SessionFacade> fmt::Debug for SharedFacade<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFacade")
            .field("facade", &self.facade.display_name())
            .field("gates", &self.gates.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedServer;

    #[test]
    fn test_channel_handle_display() {
        assert_eq!(ChannelHandle(3).to_string(), "ch-3");
    }

    #[test]
    fn test_limits_clamp() {
        assert_eq!(ServerLimits::clamp(0, 40), 40);
        assert_eq!(ServerLimits::clamp(16, 40), 16);
        assert_eq!(ServerLimits::clamp(100, 40), 40);
    }

    #[test]
    fn test_event_accessors() {
        let event = FacadeEvent::KeepAlive {
            channel: ChannelHandle(2),
            subscription_id: 9,
        };
        assert_eq!(event.channel(), ChannelHandle(2));
        assert_eq!(event.subscription_id(), Some(9));

        let event = FacadeEvent::ChannelDown {
            channel: ChannelHandle(2),
            reason: "reset".into(),
        };
        assert_eq!(event.subscription_id(), None);
    }

    #[tokio::test]
    async fn test_gate_serializes_one_channel() {
        let shared = SharedFacade::new(SimulatedServer::new());

        let held = shared.gate(ChannelHandle(1)).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), shared.gate(ChannelHandle(1))).await;
        assert!(blocked.is_err());

        let other =
            tokio::time::timeout(Duration::from_millis(20), shared.gate(ChannelHandle(2))).await;
        assert!(other.is_ok());

        drop(held);
        let free =
            tokio::time::timeout(Duration::from_millis(20), shared.gate(ChannelHandle(1))).await;
        assert!(free.is_ok());
    }
}
