// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-memory OPC UA server implementing [`SessionFacade`].
//!
//! Used by the tests and by the binary's `--simulate` mode.
//!
//! ## Address space
//!
//! ```text
//! Root
//! ├── Objects
//! │   ├── Server ── ServerStatus ── CurrentTime, State
//! │   ├── Demo (ns=2)
//! │   │   ├── Static ── Double, Int32, String, Boolean, Shared
//! │   │   ├── Dynamic ── Boiler ── Temperature, Pressure, Demo (cycle)
//! │   │   │           └── Shared (diamond)
//! │   │   ├── Custom ── Struct (custom data type)
//! │   │   └── Methods ── Multiply
//! │   └── Plant (ns=3) ── Var0000 .. VarNNNN
//! ├── Types ── BaseDataVariableType
//! └── Views
//! ```
//!
//! ## Fault injection
//!
//! - `fail_next_opens(n)`: the next `n` opens are refused
//! - `set_unreachable(url, true)`: every open of `url` is refused
//! - `set_open_delay(d)`: opens take `d`; longer than the timeout fails
//! - `drop_channel(ch)`: the channel dies and `ChannelDown` is published
//! - `reject_transfers(true)`: every transfer is rejected
//! - `set_limits(..)`: server operation limits
//! - `hide_limits(true)`: limits are enforced but reported as unlimited
//! - `pause_publishing(true)`: subscriptions stop publishing, even keep-alives

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{
    BrowseError, CapacityError, ConnectionError, OperationError, SessionResult, TimeoutError,
    TransferError,
};
use crate::session::facade::{
    BrowseResponse, CallResponse, ChannelHandle, FacadeEvent, MonitoredItemRequest,
    MonitoredItemResult, ReferenceDescription, ServerLimits, SessionFacade, SubscriptionParameters,
};
use crate::types::{DataValue, EndpointTarget, NodeClass, NodeId, NodeRef, StatusCode, UaValue};

/// Plant variables created by [`SimulatedServer::new`].
pub const DEFAULT_PLANT_VARIABLES: usize = 25;

/// Data changes published per subscription and publishing interval.
const CHANGES_PER_PUBLISH: usize = 4;

const EVENT_CAPACITY: usize = 16_384;

// =============================================================================
// Address space
// =============================================================================

#[derive(Debug, Clone)]
struct SimNode {
    node: NodeRef,
    children: Vec<NodeId>,
    value: Option<UaValue>,
    writable: bool,
}

#[derive(Debug, Default)]
struct AddressSpace {
    nodes: HashMap<NodeId, SimNode>,
}

impl AddressSpace {
    fn insert(&mut self, parent: Option<&NodeId>, node: NodeRef, value: Option<UaValue>, writable: bool) {
        let id = node.node_id.clone();
        self.nodes.insert(
            id.clone(),
            SimNode {
                node,
                children: Vec::new(),
                value,
                writable,
            },
        );
        if let Some(parent) = parent {
            self.link(parent, &id);
        }
    }

    fn folder(&mut self, parent: Option<&NodeId>, id: NodeId, name: &str) {
        let node = NodeRef::new(id, NodeClass::Object, name).with_type_definition(NodeId::FOLDER_TYPE);
        self.insert(parent, node, None, false);
    }

    fn variable(&mut self, parent: &NodeId, node: NodeRef, value: UaValue, writable: bool) {
        self.insert(Some(parent), node, Some(value), writable);
    }

    fn link(&mut self, parent: &NodeId, child: &NodeId) {
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.children.push(child.clone());
        }
    }

    fn build(plant_variables: usize) -> Self {
        let mut space = Self::default();
        let root = NodeId::ROOT_FOLDER;
        let objects = NodeId::OBJECTS_FOLDER;

        space.folder(None, root.clone(), "Root");
        space.folder(Some(&root), objects.clone(), "Objects");
        space.folder(Some(&root), NodeId::TYPES_FOLDER, "Types");
        space.folder(Some(&root), NodeId::VIEWS_FOLDER, "Views");
        space.insert(
            Some(&NodeId::TYPES_FOLDER),
            NodeRef::new(NodeId::BASE_DATA_VARIABLE_TYPE, NodeClass::VariableType, "BaseDataVariableType"),
            None,
            false,
        );

        // Server object
        space.insert(
            Some(&objects),
            NodeRef::new(NodeId::SERVER, NodeClass::Object, "Server").with_type_definition(NodeId::numeric(0, 2004)),
            None,
            false,
        );
        space.variable(
            &NodeId::SERVER,
            NodeRef::new(NodeId::SERVER_STATUS, NodeClass::Variable, "ServerStatus")
                .with_type_definition(NodeId::numeric(0, 2138))
                .with_data_type(NodeId::numeric(0, 862)),
            UaValue::String("Running".into()),
            false,
        );
        space.variable(
            &NodeId::SERVER_STATUS,
            NodeRef::new(NodeId::SERVER_STATUS_CURRENT_TIME, NodeClass::Variable, "CurrentTime")
                .with_type_definition(NodeId::BASE_DATA_VARIABLE_TYPE)
                .with_data_type(NodeId::numeric(0, 13)),
            UaValue::DateTime(Utc::now()),
            false,
        );
        space.variable(
            &NodeId::SERVER_STATUS,
            NodeRef::new(NodeId::SERVER_STATUS_STATE, NodeClass::Variable, "State")
                .with_type_definition(NodeId::BASE_DATA_VARIABLE_TYPE)
                .with_data_type(NodeId::numeric(0, 852)),
            UaValue::Int32(0),
            false,
        );

        // Demo (ns=2)
        let demo = NodeId::string(2, "Demo");
        let static_folder = NodeId::string(2, "Demo.Static");
        let dynamic = NodeId::string(2, "Demo.Dynamic");
        let custom = NodeId::string(2, "Demo.Custom");
        let shared = NodeId::string(2, "Demo.Shared");
        let boiler = NodeId::string(2, "Demo.Dynamic.Boiler");

        space.folder(Some(&objects), demo.clone(), "Demo");
        space.folder(Some(&demo), static_folder.clone(), "Static");
        space.folder(Some(&demo), dynamic.clone(), "Dynamic");
        space.folder(Some(&demo), custom.clone(), "Custom");
        space.folder(Some(&demo), SimulatedServer::methods_folder(), "Methods");

        let base_variable = |id: NodeId, name: &str, data_type: u32| {
            NodeRef::new(id, NodeClass::Variable, name)
                .with_type_definition(NodeId::BASE_DATA_VARIABLE_TYPE)
                .with_data_type(NodeId::numeric(0, data_type))
        };
        space.variable(
            &static_folder,
            base_variable(SimulatedServer::static_double(), "Double", 11),
            UaValue::Double(0.0),
            true,
        );
        space.variable(
            &static_folder,
            base_variable(NodeId::string(2, "Demo.Static.Int32"), "Int32", 6),
            UaValue::Int32(0),
            true,
        );
        space.variable(
            &static_folder,
            base_variable(NodeId::string(2, "Demo.Static.String"), "String", 12),
            UaValue::String(String::new()),
            true,
        );
        space.variable(
            &static_folder,
            base_variable(NodeId::string(2, "Demo.Static.Boolean"), "Boolean", 1),
            UaValue::Boolean(false),
            true,
        );
        space.variable(&static_folder, base_variable(shared.clone(), "Shared", 11), UaValue::Double(1.0), true);
        space.link(&dynamic, &shared);

        space.insert(
            Some(&dynamic),
            NodeRef::new(boiler.clone(), NodeClass::Object, "Boiler").with_type_definition(NodeId::numeric(2, 1001)),
            None,
            false,
        );
        for (name, value) in [("Temperature", 21.5), ("Pressure", 1.013)] {
            space.variable(
                &boiler,
                NodeRef::new(NodeId::string(2, format!("Demo.Dynamic.Boiler.{name}")), NodeClass::Variable, name)
                    .with_type_definition(NodeId::numeric(2, 1002))
                    .with_data_type(NodeId::numeric(0, 11)),
                UaValue::Double(value),
                false,
            );
        }
        space.link(&boiler, &demo);

        space.variable(
            &custom,
            NodeRef::new(NodeId::string(2, "Demo.Custom.Struct"), NodeClass::Variable, "Struct")
                .with_type_definition(NodeId::BASE_DATA_VARIABLE_TYPE)
                .with_data_type(NodeId::numeric(2, 3001)),
            UaValue::String("{\"a\":1}".into()),
            false,
        );

        space.insert(
            Some(&SimulatedServer::methods_folder()),
            NodeRef::new(SimulatedServer::multiply_method(), NodeClass::Method, "Multiply"),
            None,
            false,
        );

        // Plant (ns=3)
        let plant = NodeId::string(3, "Plant");
        space.folder(Some(&objects), plant.clone(), "Plant");
        for i in 0..plant_variables {
            space.variable(
                &plant,
                NodeRef::new(SimulatedServer::plant_variable(i), NodeClass::Variable, format!("Var{i:04}"))
                    .with_type_definition(NodeId::numeric(3, 2001))
                    .with_data_type(NodeId::numeric(0, 11)),
                UaValue::Double(i as f64),
                true,
            );
        }

        space
    }
}

// =============================================================================
// Server state
// =============================================================================

#[derive(Debug)]
struct SimSubscription {
    channel: Option<ChannelHandle>,
    params: SubscriptionParameters,
    items: Vec<MonitoredItemRequest>,
    cursor: usize,
    orphaned_ticks: u32,
}

#[derive(Debug, Default)]
struct SimState {
    open_channels: HashSet<ChannelHandle>,
    subscriptions: HashMap<u32, SimSubscription>,
    limits: ServerLimits,
    hide_limits: bool,
    max_subscriptions: usize,
    publishing_paused: bool,
    fail_next_opens: u32,
    unreachable: HashSet<String>,
    reject_transfers: bool,
    open_delay: Duration,
}

struct Inner {
    space: Mutex<AddressSpace>,
    state: Mutex<SimState>,
    events: broadcast::Sender<FacadeEvent>,
    next_channel: AtomicU64,
    next_subscription: AtomicU32,
    next_item: AtomicU32,
    plant_variables: usize,

    open_attempts: AtomicU64,
    browse_calls: AtomicU64,
    largest_browse_request: AtomicU64,
    transfers: AtomicU64,
}

impl Inner {
    fn ensure_open(&self, channel: ChannelHandle) -> SessionResult<()> {
        if self.state.lock().open_channels.contains(&channel) {
            Ok(())
        } else {
            Err(ConnectionError::closed(format!("{channel} is not open")).into())
        }
    }

    /// Runs one publishing cycle; returns `false` once the subscription is gone.
    fn publish(&self, server_id: u32, sequence: u64) -> bool {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let SimState {
                subscriptions,
                open_channels,
                publishing_paused,
                ..
            } = &mut *state;

            let Some(sub) = subscriptions.get_mut(&server_id) else {
                return false;
            };

            match sub.channel.filter(|c| open_channels.contains(c)) {
                None => {
                    sub.orphaned_ticks += 1;
                    if sub.orphaned_ticks > sub.params.lifetime_count {
                        subscriptions.remove(&server_id);
                        tracing::debug!(subscription_id = server_id, "Simulated subscription expired");
                        return false;
                    }
                }
                Some(_) if *publishing_paused => sub.orphaned_ticks = 0,
                Some(channel) => {
                    sub.orphaned_ticks = 0;
                    if sub.items.is_empty() {
                        events.push(FacadeEvent::KeepAlive {
                            channel,
                            subscription_id: server_id,
                        });
                    }
                    for _ in 0..CHANGES_PER_PUBLISH.min(sub.items.len()) {
                        let item = &sub.items[sub.cursor % sub.items.len()];
                        sub.cursor = sub.cursor.wrapping_add(1);
                        events.push(FacadeEvent::DataChange {
                            channel,
                            subscription_id: server_id,
                            client_handle: item.client_handle,
                            value: DataValue::good(UaValue::Double(sequence as f64)),
                        });
                    }
                }
            }
        }

        for event in events {
            let _ = self.events.send(event);
        }
        true
    }
}

// =============================================================================
// SimulatedServer
// =============================================================================

/// A deterministic in-memory server.
///
/// Clones share the same server.
#[derive(Clone)]
pub struct SimulatedServer {
    inner: Arc<Inner>,
}

impl SimulatedServer {
    /// Creates a server with [`DEFAULT_PLANT_VARIABLES`] plant variables.
    pub fn new() -> Self {
        Self::with_plant_variables(DEFAULT_PLANT_VARIABLES)
    }

    /// Creates a server with `count` plant variables in namespace 3.
    pub fn with_plant_variables(count: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                space: Mutex::new(AddressSpace::build(count)),
                state: Mutex::new(SimState::default()),
                events,
                next_channel: AtomicU64::new(1),
                next_subscription: AtomicU32::new(1),
                next_item: AtomicU32::new(1),
                plant_variables: count,
                open_attempts: AtomicU64::new(0),
                browse_calls: AtomicU64::new(0),
                largest_browse_request: AtomicU64::new(0),
                transfers: AtomicU64::new(0),
            }),
        }
    }

    // =========================================================================
    // Well-known nodes
    // =========================================================================

    /// A writable Double variable.
    pub fn static_double() -> NodeId {
        NodeId::string(2, "Demo.Static.Double")
    }

    /// Object owning the demo methods.
    pub fn methods_folder() -> NodeId {
        NodeId::string(2, "Demo.Methods")
    }

    /// `Multiply(a: Double, b: Double) -> Double`.
    pub fn multiply_method() -> NodeId {
        NodeId::string(2, "Demo.Methods.Multiply")
    }

    /// Identifier of plant variable `index`.
    pub fn plant_variable(index: usize) -> NodeId {
        NodeId::string(3, format!("Plant.Var{index:04}"))
    }

    /// Every plant variable, in index order.
    pub fn plant_variables(&self) -> Vec<NodeRef> {
        let space = self.inner.space.lock();
        (0..self.inner.plant_variables)
            .filter_map(|i| space.nodes.get(&Self::plant_variable(i)))
            .map(|n| n.node.clone())
            .collect()
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Refuses the next `count` opens.
    pub fn fail_next_opens(&self, count: u32) {
        self.inner.state.lock().fail_next_opens = count;
    }

    /// Refuses every open of `url` while `unreachable` is set.
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        let mut state = self.inner.state.lock();
        if unreachable {
            state.unreachable.insert(url.to_string());
        } else {
            state.unreachable.remove(url);
        }
    }

    /// Makes every open take `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        self.inner.state.lock().open_delay = delay;
    }

    /// Kills a channel and publishes `ChannelDown`.
    ///
    /// Its subscriptions stay on the server until their lifetime expires.
    pub fn drop_channel(&self, channel: ChannelHandle) {
        {
            let mut state = self.inner.state.lock();
            if !state.open_channels.remove(&channel) {
                return;
            }
            for sub in state.subscriptions.values_mut() {
                if sub.channel == Some(channel) {
                    sub.channel = None;
                }
            }
        }
        tracing::debug!(channel = %channel, "Simulated channel dropped");
        let _ = self.inner.events.send(FacadeEvent::ChannelDown {
            channel,
            reason: "connection reset by peer".into(),
        });
    }

    /// Rejects every transfer while set.
    pub fn reject_transfers(&self, reject: bool) {
        self.inner.state.lock().reject_transfers = reject;
    }

    /// Sets the advertised operation limits.
    pub fn set_limits(&self, limits: ServerLimits) {
        self.inner.state.lock().limits = limits;
    }

    /// Keeps enforcing the limits while reporting them as unlimited.
    pub fn hide_limits(&self, hide: bool) {
        self.inner.state.lock().hide_limits = hide;
    }

    /// Limits the number of subscriptions; zero means unlimited.
    pub fn set_max_subscriptions(&self, max: usize) {
        self.inner.state.lock().max_subscriptions = max;
    }

    /// Stops or resumes publishing, keep-alives included.
    pub fn pause_publishing(&self, paused: bool) {
        self.inner.state.lock().publishing_paused = paused;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Open attempts, failed ones included.
    pub fn open_attempts(&self) -> u64 {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    /// Returns `true` if `channel` is open.
    pub fn is_open(&self, channel: ChannelHandle) -> bool {
        self.inner.state.lock().open_channels.contains(&channel)
    }

    /// Number of open channels.
    pub fn open_channel_count(&self) -> usize {
        self.inner.state.lock().open_channels.len()
    }

    /// Subscriptions alive on the server, orphaned ones included.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Channel a server subscription is bound to.
    pub fn subscription_channel(&self, subscription_id: u32) -> Option<ChannelHandle> {
        self.inner
            .state
            .lock()
            .subscriptions
            .get(&subscription_id)
            .and_then(|s| s.channel)
    }

    /// Monitored items of a server subscription.
    pub fn monitored_item_count(&self, subscription_id: u32) -> usize {
        self.inner
            .state
            .lock()
            .subscriptions
            .get(&subscription_id)
            .map_or(0, |s| s.items.len())
    }

    /// Browse round trips served.
    pub fn browse_calls(&self) -> u64 {
        self.inner.browse_calls.load(Ordering::SeqCst)
    }

    /// Most parents seen in one browse request.
    pub fn largest_browse_request(&self) -> usize {
        self.inner.largest_browse_request.load(Ordering::SeqCst) as usize
    }

    /// Successful transfers.
    pub fn transfers(&self) -> u64 {
        self.inner.transfers.load(Ordering::SeqCst)
    }

    fn spawn_publisher(&self, server_id: u32, interval: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                sequence += 1;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.publish(server_id, sequence) {
                    break;
                }
            }
        });
    }

    fn call_multiply(args: &[UaValue]) -> CallResponse {
        let failed = |status| CallResponse {
            status,
            outputs: Vec::new(),
            input_argument_results: Vec::new(),
        };

        match args.len() {
            n if n < 2 => return failed(StatusCode::BAD_ARGUMENTS_MISSING),
            n if n > 2 => return failed(StatusCode::BAD_INVALID_ARGUMENT),
            _ => {}
        }

        let numbers: Vec<Option<f64>> = args.iter().map(UaValue::as_f64).collect();
        let input_argument_results: Vec<StatusCode> = numbers
            .iter()
            .map(|n| if n.is_some() { StatusCode::GOOD } else { StatusCode::BAD_TYPE_MISMATCH })
            .collect();

        match (numbers[0], numbers[1]) {
            (Some(a), Some(b)) => CallResponse {
                status: StatusCode::GOOD,
                outputs: vec![UaValue::Double(a * b)],
                input_argument_results,
            },
            _ => CallResponse {
                status: StatusCode::BAD_INVALID_ARGUMENT,
                outputs: Vec::new(),
                input_argument_results,
            },
        }
    }
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimulatedServer")
            .field("open_channels", &state.open_channels.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("plant_variables", &self.inner.plant_variables)
            .finish()
    }
}

// =============================================================================
// SessionFacade
// =============================================================================

#[async_trait]
impl SessionFacade for SimulatedServer {
    async fn open(&self, target: &EndpointTarget, timeout: Duration) -> SessionResult<ChannelHandle> {
        self.inner.open_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.inner.state.lock().open_delay;
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TimeoutError::connection(target.url(), timeout).into());
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.state.lock();
        if state.unreachable.contains(target.url()) {
            return Err(ConnectionError::refused(target.url()).into());
        }
        if state.fail_next_opens > 0 {
            state.fail_next_opens -= 1;
            return Err(ConnectionError::refused(target.url()).into());
        }

        let channel = ChannelHandle(self.inner.next_channel.fetch_add(1, Ordering::SeqCst));
        state.open_channels.insert(channel);
        tracing::debug!(channel = %channel, endpoint = target.url(), "Simulated channel opened");
        Ok(channel)
    }

    async fn close(&self, channel: ChannelHandle, keep_subscriptions_alive: bool) -> SessionResult<()> {
        let mut state = self.inner.state.lock();
        if !state.open_channels.remove(&channel) {
            return Ok(());
        }

        if keep_subscriptions_alive {
            for sub in state.subscriptions.values_mut() {
                if sub.channel == Some(channel) {
                    sub.channel = None;
                }
            }
        } else {
            state.subscriptions.retain(|_, s| s.channel != Some(channel));
        }
        tracing::debug!(channel = %channel, keep_subscriptions_alive, "Simulated channel closed");
        Ok(())
    }

    async fn browse(&self, channel: ChannelHandle, parents: &[NodeId]) -> SessionResult<Vec<BrowseResponse>> {
        self.inner.ensure_open(channel)?;
        self.inner.browse_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .largest_browse_request
            .fetch_max(parents.len() as u64, Ordering::SeqCst);

        let max = self.inner.state.lock().limits.max_nodes_per_browse;
        if max != 0 && parents.len() > max {
            return Err(OperationError::service_fault("Browse", StatusCode::BAD_TOO_MANY_OPERATIONS).into());
        }

        let space = self.inner.space.lock();
        let responses = parents
            .iter()
            .map(|parent| match space.nodes.get(parent) {
                Some(node) => BrowseResponse {
                    parent: parent.clone(),
                    status: StatusCode::GOOD,
                    references: node
                        .children
                        .iter()
                        .filter_map(|child| space.nodes.get(child))
                        .map(|child| ReferenceDescription {
                            node_id: child.node.node_id.clone(),
                            browse_name: child.node.browse_name.clone(),
                            display_name: child.node.display_name.clone(),
                            node_class: child.node.node_class,
                            type_definition: child.node.type_definition.clone(),
                        })
                        .collect(),
                },
                None => BrowseResponse {
                    parent: parent.clone(),
                    status: StatusCode::BAD_NODE_ID_UNKNOWN,
                    references: Vec::new(),
                },
            })
            .collect();
        Ok(responses)
    }

    async fn fetch_node_cache(&self, channel: ChannelHandle, root: &NodeId) -> SessionResult<Vec<NodeRef>> {
        self.inner.ensure_open(channel)?;

        let space = self.inner.space.lock();
        if !space.nodes.contains_key(root) {
            return Err(BrowseError::node_not_found(root.to_string()).into());
        }

        let mut seen = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        let mut snapshot = Vec::new();
        while let Some(id) = queue.pop_front() {
            let Some(node) = space.nodes.get(&id) else { continue };
            for child in &node.children {
                if seen.insert(child.clone()) {
                    if let Some(child_node) = space.nodes.get(child) {
                        snapshot.push(child_node.node.clone());
                    }
                    queue.push_back(child.clone());
                }
            }
        }
        Ok(snapshot)
    }

    async fn read(&self, channel: ChannelHandle, nodes: &[NodeId]) -> SessionResult<Vec<DataValue>> {
        self.inner.ensure_open(channel)?;
        let max = self.inner.state.lock().limits.max_nodes_per_read;
        if max != 0 && nodes.len() > max {
            return Err(OperationError::service_fault("Read", StatusCode::BAD_TOO_MANY_OPERATIONS).into());
        }

        let space = self.inner.space.lock();
        Ok(nodes
            .iter()
            .map(|id| {
                if *id == NodeId::SERVER_STATUS_CURRENT_TIME {
                    return DataValue::good(UaValue::DateTime(Utc::now()));
                }
                match space.nodes.get(id) {
                    Some(SimNode { value: Some(value), .. }) => DataValue::good(value.clone()),
                    Some(_) => DataValue::bad(StatusCode::BAD_ATTRIBUTE_ID_INVALID),
                    None => DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN),
                }
            })
            .collect())
    }

    async fn write(&self, channel: ChannelHandle, writes: &[(NodeId, UaValue)]) -> SessionResult<Vec<StatusCode>> {
        self.inner.ensure_open(channel)?;
        let max = self.inner.state.lock().limits.max_nodes_per_read;
        if max != 0 && writes.len() > max {
            return Err(OperationError::service_fault("Write", StatusCode::BAD_TOO_MANY_OPERATIONS).into());
        }

        let mut space = self.inner.space.lock();
        Ok(writes
            .iter()
            .map(|(id, value)| match space.nodes.get_mut(id) {
                None => StatusCode::BAD_NODE_ID_UNKNOWN,
                Some(node) if !node.writable => StatusCode::BAD_NOT_WRITABLE,
                Some(node) => match &mut node.value {
                    Some(current) if current.same_type(value) => {
                        *current = value.clone();
                        StatusCode::GOOD
                    }
                    Some(_) => StatusCode::BAD_TYPE_MISMATCH,
                    None => StatusCode::BAD_ATTRIBUTE_ID_INVALID,
                },
            })
            .collect())
    }

    async fn call(
        &self,
        channel: ChannelHandle,
        object: &NodeId,
        method: &NodeId,
        args: &[UaValue],
    ) -> SessionResult<CallResponse> {
        self.inner.ensure_open(channel)?;

        if *method != Self::multiply_method() || *object != Self::methods_folder() {
            return Ok(CallResponse {
                status: StatusCode::BAD_METHOD_INVALID,
                outputs: Vec::new(),
                input_argument_results: Vec::new(),
            });
        }
        Ok(Self::call_multiply(args))
    }

    async fn server_limits(&self, channel: ChannelHandle) -> SessionResult<ServerLimits> {
        self.inner.ensure_open(channel)?;
        let state = self.inner.state.lock();
        Ok(if state.hide_limits {
            ServerLimits::default()
        } else {
            state.limits
        })
    }

    async fn create_subscription(
        &self,
        channel: ChannelHandle,
        params: &SubscriptionParameters,
    ) -> SessionResult<u32> {
        self.inner.ensure_open(channel)?;

        let server_id = {
            let mut state = self.inner.state.lock();
            if state.max_subscriptions != 0 && state.subscriptions.len() >= state.max_subscriptions {
                return Err(CapacityError::too_many_subscriptions(StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS).into());
            }
            let server_id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
            state.subscriptions.insert(
                server_id,
                SimSubscription {
                    channel: Some(channel),
                    params: *params,
                    items: Vec::new(),
                    cursor: 0,
                    orphaned_ticks: 0,
                },
            );
            server_id
        };

        self.spawn_publisher(server_id, params.publishing_interval);
        Ok(server_id)
    }

    async fn create_monitored_items(
        &self,
        channel: ChannelHandle,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> SessionResult<Vec<MonitoredItemResult>> {
        self.inner.ensure_open(channel)?;

        let known: Vec<bool> = {
            let space = self.inner.space.lock();
            items.iter().map(|i| space.nodes.contains_key(&i.node_id)).collect()
        };

        let mut state = self.inner.state.lock();
        let limits = state.limits;
        if limits.max_monitored_items_per_call != 0 && items.len() > limits.max_monitored_items_per_call {
            return Err(
                OperationError::service_fault("CreateMonitoredItems", StatusCode::BAD_TOO_MANY_OPERATIONS).into(),
            );
        }
        let Some(sub) = state.subscriptions.get_mut(&subscription_id) else {
            return Err(
                OperationError::service_fault("CreateMonitoredItems", StatusCode::BAD_SUBSCRIPTION_ID_INVALID)
                    .into(),
            );
        };

        let results = items
            .iter()
            .zip(known)
            .map(|(item, known)| {
                let max = limits.max_monitored_items_per_subscription;
                let status = if !known {
                    StatusCode::BAD_NODE_ID_UNKNOWN
                } else if max != 0 && sub.items.len() >= max {
                    StatusCode::BAD_TOO_MANY_MONITORED_ITEMS
                } else {
                    sub.items.push(item.clone());
                    StatusCode::GOOD
                };
                MonitoredItemResult {
                    client_handle: item.client_handle,
                    status,
                    server_item_id: if status.is_good() {
                        self.inner.next_item.fetch_add(1, Ordering::SeqCst)
                    } else {
                        0
                    },
                }
            })
            .collect();
        Ok(results)
    }

    async fn delete_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()> {
        self.inner.ensure_open(channel)?;
        match self.inner.state.lock().subscriptions.remove(&subscription_id) {
            Some(_) => Ok(()),
            None => Err(
                OperationError::service_fault("DeleteSubscriptions", StatusCode::BAD_SUBSCRIPTION_ID_INVALID).into(),
            ),
        }
    }

    async fn transfer_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()> {
        self.inner.ensure_open(channel)?;

        let mut state = self.inner.state.lock();
        if state.reject_transfers {
            return Err(TransferError::rejected(subscription_id, StatusCode::BAD_USER_ACCESS_DENIED).into());
        }
        let Some(sub) = state.subscriptions.get_mut(&subscription_id) else {
            return Err(TransferError::not_found(subscription_id).into());
        };
        sub.channel = Some(channel);
        sub.orphaned_ticks = 0;
        self.inner.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<FacadeEvent> {
        self.inner.events.subscribe()
    }

    fn display_name(&self) -> String {
        "SimulatedServer".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> EndpointTarget {
        EndpointTarget::new("opc.tcp://sim")
    }

    #[tokio::test]
    async fn test_open_faults() {
        let server = SimulatedServer::new();
        server.fail_next_opens(2);

        assert!(server.open(&target(), Duration::from_secs(1)).await.is_err());
        assert!(server.open(&target(), Duration::from_secs(1)).await.is_err());
        let channel = server.open(&target(), Duration::from_secs(1)).await.unwrap();
        assert!(server.is_open(channel));
        assert_eq!(server.open_attempts(), 3);

        server.set_unreachable("opc.tcp://sim", true);
        assert!(server.open(&target(), Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_open_times_out() {
        let server = SimulatedServer::new();
        server.set_open_delay(Duration::from_secs(30));

        let err = server.open(&target(), Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.error_code().to_string(), "UA-0201");
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_requests() {
        let server = SimulatedServer::new();
        let channel = server.open(&target(), Duration::from_secs(1)).await.unwrap();
        server.close(channel, false).await.unwrap();

        let err = server.read(channel, &[NodeId::SERVER_STATUS_STATE]).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_SESSION_CLOSED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_subscriptions_alive_on_close() {
        let server = SimulatedServer::new();
        let channel = server.open(&target(), Duration::from_secs(1)).await.unwrap();
        let params = SubscriptionParameters {
            publishing_interval: Duration::from_secs(1),
            lifetime_count: 10,
            keep_alive_count: 2,
        };
        let id = server.create_subscription(channel, &params).await.unwrap();

        server.close(channel, true).await.unwrap();
        assert_eq!(server.subscription_count(), 1);
        assert_eq!(server.subscription_channel(id), None);

        let next = server.open(&target(), Duration::from_secs(1)).await.unwrap();
        server.transfer_subscription(next, id).await.unwrap();
        assert_eq!(server.subscription_channel(id), Some(next));
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_subscription_expires() {
        let server = SimulatedServer::new();
        let channel = server.open(&target(), Duration::from_secs(1)).await.unwrap();
        let params = SubscriptionParameters {
            publishing_interval: Duration::from_secs(1),
            lifetime_count: 6,
            keep_alive_count: 2,
        };
        let id = server.create_subscription(channel, &params).await.unwrap();
        server.close(channel, true).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.subscription_count(), 0);

        let next = server.open(&target(), Duration::from_secs(1)).await.unwrap();
        let err = server.transfer_subscription(next, id).await.unwrap_err();
        assert_eq!(err.error_code().to_string(), "UA-0302");
    }

    #[test]
    fn test_multiply() {
        let response = SimulatedServer::call_multiply(&[UaValue::Int32(3), UaValue::Double(2.5)]);
        assert_eq!(response.outputs, vec![UaValue::Double(7.5)]);

        let response = SimulatedServer::call_multiply(&[UaValue::Int32(3), UaValue::String("x".into())]);
        assert_eq!(response.status, StatusCode::BAD_INVALID_ARGUMENT);
        assert_eq!(response.input_argument_results[1], StatusCode::BAD_TYPE_MISMATCH);
    }
}
