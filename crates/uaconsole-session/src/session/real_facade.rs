// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! [`SessionFacade`] over the `opcua` crate.
//!
//! The `opcua` client API is blocking, so every request runs on the blocking
//! pool. Each channel is one `opcua` session with its own publish loop.
//!
//! The crate cannot close a session while keeping its subscriptions, so
//! `transfer_subscription` always reports `TransferError::Unsupported` and the
//! controller re-creates the subscription instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use opcua::client::prelude::*;
use opcua::sync::RwLock as OpcUaRwLock;

use super::facade::{
    BrowseResponse, CallResponse, ChannelHandle, FacadeEvent, MonitoredItemRequest,
    MonitoredItemResult, ReferenceDescription, ServerLimits, SessionFacade, SubscriptionParameters,
};
use crate::error::{
    BrowseError, ConnectionError, OperationError, SessionError, SessionResult, SubscriptionError,
    TransferError,
};
use crate::types::{
    DataValue, EndpointTarget, NodeClass, NodeId, NodeIdentifier, NodeRef, SecurityMode,
    StatusCode, UaValue,
};

const EVENT_CAPACITY: usize = 16384;
const APPLICATION_NAME: &str = "uaconsole";
const APPLICATION_URI: &str = "urn:localhost:uaconsole";

// OperationLimits variables of the Server object.
const MAX_NODES_PER_READ: u32 = 11705;
const MAX_NODES_PER_BROWSE: u32 = 11710;
const MAX_MONITORED_ITEMS_PER_CALL: u32 = 11714;

type SharedSession = Arc<OpcUaRwLock<Session>>;

struct OpenChannel {
    session: SharedSession,
    stop: Option<tokio::sync::oneshot::Sender<SessionCommand>>,
}

// =============================================================================
// OpcUaFacade
// =============================================================================

/// Facade over real OPC UA servers.
pub struct OpcUaFacade {
    pki_dir: std::path::PathBuf,
    channels: Mutex<HashMap<ChannelHandle, OpenChannel>>,
    next_channel: AtomicU64,
    events: broadcast::Sender<FacadeEvent>,
}

impl OpcUaFacade {
    /// Creates a facade keeping certificates below `pki_dir`.
    pub fn new(pki_dir: impl Into<std::path::PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pki_dir: pki_dir.into(),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            events,
        }
    }

    fn session(&self, channel: ChannelHandle) -> SessionResult<SharedSession> {
        self.channels
            .lock()
            .get(&channel)
            .map(|c| Arc::clone(&c.session))
            .ok_or_else(|| ConnectionError::closed(format!("{channel} is not open")).into())
    }

    fn build_client(&self) -> SessionResult<Client> {
        ClientBuilder::new()
            .application_name(APPLICATION_NAME)
            .application_uri(APPLICATION_URI)
            .product_uri(APPLICATION_URI)
            .pki_dir(self.pki_dir.clone())
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .session_retry_limit(0)
            .client()
            .ok_or_else(|| ConnectionError::transport("failed to build OPC UA client").into())
    }

    /// Runs a blocking session call on the blocking pool.
    async fn blocking<T, Op>(&self, channel: ChannelHandle, service: &'static str, op: Op) -> SessionResult<T>
    where
        T: Send + 'static,
        Op: FnOnce(&Session) -> Result<T, opcua::types::StatusCode> + Send + 'static,
    {
        let session = self.session(channel)?;
        let result = tokio::task::spawn_blocking(move || {
            let session = session.read();
            op(&session)
        })
        .await
        .map_err(|e| ConnectionError::transport(format!("{service} task failed: {e}")))?;

        result.map_err(|status| map_status(service, status))
    }
}

#[async_trait]
impl SessionFacade for OpcUaFacade {
    async fn open(&self, target: &EndpointTarget, timeout: Duration) -> SessionResult<ChannelHandle> {
        let mut client = self.build_client()?;
        let url = target.url().to_string();
        let (policy, mode) = match target.security_mode() {
            SecurityMode::None => (SecurityPolicy::None, MessageSecurityMode::None),
            SecurityMode::Sign => (SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign),
            SecurityMode::SignAndEncrypt => {
                (SecurityPolicy::Basic256Sha256, MessageSecurityMode::SignAndEncrypt)
            }
        };

        info!(endpoint = %url, security = %target.security_mode(), "Opening OPC UA session");

        let endpoint_url = url.clone();
        let connect = tokio::task::spawn_blocking(move || {
            client.connect_to_endpoint(
                (
                    endpoint_url.as_str(),
                    policy.to_str(),
                    mode,
                    UserTokenPolicy::anonymous(),
                ),
                IdentityToken::Anonymous,
            )
        });

        let session = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(Ok(session))) => session,
            Ok(Ok(Err(status))) => {
                return Err(ConnectionError::handshake_rejected(&url, status.to_string()).into())
            }
            Ok(Err(e)) => return Err(ConnectionError::transport(e.to_string()).into()),
            Err(_) => return Err(crate::error::TimeoutError::connection(&url, timeout).into()),
        };

        let channel = ChannelHandle(self.next_channel.fetch_add(1, Ordering::Relaxed));
        {
            let events = self.events.clone();
            let mut locked = session.write();
            locked.set_connection_status_callback(ConnectionStatusCallback::new(move |connected| {
                if !connected {
                    let _ = events.send(FacadeEvent::ChannelDown {
                        channel,
                        reason: "connection lost".into(),
                    });
                }
            }));
        }
        let stop = Session::run_async(Arc::clone(&session));

        self.channels.lock().insert(
            channel,
            OpenChannel {
                session,
                stop: Some(stop),
            },
        );
        debug!(channel = %channel, endpoint = %url, "OPC UA session active");
        Ok(channel)
    }

    async fn close(&self, channel: ChannelHandle, keep_subscriptions_alive: bool) -> SessionResult<()> {
        let Some(mut open) = self.channels.lock().remove(&channel) else {
            return Ok(());
        };
        if keep_subscriptions_alive {
            warn!(channel = %channel, "Subscriptions cannot outlive an opcua session; closing fully");
        }
        if let Some(stop) = open.stop.take() {
            let _ = stop.send(SessionCommand::Stop);
        }
        let session = open.session;
        tokio::task::spawn_blocking(move || session.read().disconnect())
            .await
            .map_err(|e| ConnectionError::transport(format!("close task failed: {e}")))?;
        Ok(())
    }

    async fn browse(&self, channel: ChannelHandle, parents: &[NodeId]) -> SessionResult<Vec<BrowseResponse>> {
        let descriptions: Vec<BrowseDescription> = parents.iter().map(browse_description).collect();
        let parents = parents.to_vec();
        let results = self
            .blocking(channel, "Browse", move |s| s.browse(&descriptions))
            .await?
            .unwrap_or_default();

        Ok(parents
            .into_iter()
            .zip(results.into_iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(parent, result)| match result {
                Some(result) => BrowseResponse {
                    parent,
                    status: StatusCode(result.status_code.bits()),
                    references: result
                        .references
                        .unwrap_or_default()
                        .iter()
                        .filter_map(from_reference)
                        .collect(),
                },
                None => BrowseResponse {
                    parent,
                    status: StatusCode::BAD_UNEXPECTED_ERROR,
                    references: Vec::new(),
                },
            })
            .collect())
    }

    async fn fetch_node_cache(&self, channel: ChannelHandle, root: &NodeId) -> SessionResult<Vec<NodeRef>> {
        // No client-side cache in this stack: load it in batched round trips.
        let root = root.clone();
        self.blocking(channel, "Browse", move |s| {
            let mut visited = HashSet::from([root.clone()]);
            let mut frontier = VecDeque::from([root]);
            let mut nodes = Vec::new();
            while !frontier.is_empty() {
                let take = frontier.len().min(64);
                let batch: Vec<NodeId> = frontier.drain(..take).collect();
                let descriptions: Vec<_> = batch.iter().map(browse_description).collect();
                for result in s.browse(&descriptions)?.unwrap_or_default() {
                    for reference in result.references.unwrap_or_default().iter() {
                        let Some(reference) = from_reference(reference) else {
                            continue;
                        };
                        if visited.insert(reference.node_id.clone()) {
                            frontier.push_back(reference.node_id.clone());
                            nodes.push(reference.to_node_ref());
                        }
                    }
                }
            }
            Ok(nodes)
        })
        .await
        .map_err(|e| BrowseError::cache_unavailable(e.to_string()).into())
    }

    async fn read(&self, channel: ChannelHandle, nodes: &[NodeId]) -> SessionResult<Vec<DataValue>> {
        let requests: Vec<ReadValueId> = nodes.iter().map(|n| read_value_id(n)).collect();
        let values = self
            .blocking(channel, "Read", move |s| {
                s.read(&requests, TimestampsToReturn::Both, 0.0)
            })
            .await?;
        Ok(values.iter().map(from_data_value).collect())
    }

    async fn write(&self, channel: ChannelHandle, writes: &[(NodeId, UaValue)]) -> SessionResult<Vec<StatusCode>> {
        let requests: Vec<WriteValue> = writes
            .iter()
            .map(|(node, value)| WriteValue {
                node_id: to_opcua_node_id(node),
                attribute_id: AttributeId::Value as u32,
                index_range: opcua::types::UAString::null(),
                value: opcua::types::DataValue::value_only(to_variant(value)),
            })
            .collect();
        let statuses = self.blocking(channel, "Write", move |s| s.write(&requests)).await?;
        Ok(statuses.iter().map(|s| StatusCode(s.bits())).collect())
    }

    async fn call(
        &self,
        channel: ChannelHandle,
        object: &NodeId,
        method: &NodeId,
        args: &[UaValue],
    ) -> SessionResult<CallResponse> {
        let request = CallMethodRequest {
            object_id: to_opcua_node_id(object),
            method_id: to_opcua_node_id(method),
            input_arguments: Some(args.iter().map(to_variant).collect()),
        };
        let result = self.blocking(channel, "Call", move |s| s.call(request)).await?;
        Ok(CallResponse {
            status: StatusCode(result.status_code.bits()),
            outputs: result
                .output_arguments
                .unwrap_or_default()
                .iter()
                .map(from_variant)
                .collect(),
            input_argument_results: result
                .input_argument_results
                .unwrap_or_default()
                .iter()
                .map(|s| StatusCode(s.bits()))
                .collect(),
        })
    }

    async fn server_limits(&self, channel: ChannelHandle) -> SessionResult<ServerLimits> {
        let ids = [MAX_NODES_PER_READ, MAX_NODES_PER_BROWSE, MAX_MONITORED_ITEMS_PER_CALL];
        let values = self.read(channel, &ids.map(|i| NodeId::numeric(0, i))).await?;
        let limit = |i: usize| {
            values
                .get(i)
                .and_then(|v| v.value.as_ref())
                .and_then(UaValue::as_f64)
                .map(|v| v as usize)
                .unwrap_or(0)
        };
        Ok(ServerLimits {
            max_monitored_items_per_subscription: 0,
            max_monitored_items_per_call: limit(2),
            max_nodes_per_browse: limit(1),
            max_nodes_per_read: limit(0),
        })
    }

    async fn create_subscription(
        &self,
        channel: ChannelHandle,
        params: &SubscriptionParameters,
    ) -> SessionResult<u32> {
        let events = self.events.clone();
        let params = *params;
        let subscription_slot = Arc::new(Mutex::new(0u32));
        let slot = Arc::clone(&subscription_slot);

        let callback = DataChangeCallback::new(move |items| {
            let subscription_id = *slot.lock();
            for item in items {
                let _ = events.send(FacadeEvent::DataChange {
                    channel,
                    subscription_id,
                    client_handle: item.client_handle(),
                    value: from_data_value(item.last_value()),
                });
            }
        });

        let id = self
            .blocking(channel, "CreateSubscription", move |s| {
                s.create_subscription(
                    params.publishing_interval.as_millis() as f64,
                    params.lifetime_count,
                    params.keep_alive_count,
                    0,
                    0,
                    true,
                    callback,
                )
            })
            .await
            .map_err(|e| -> SessionError {
                match e {
                SessionError::Operation(OperationError::ServiceFault { status, .. })
                    if status == StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS =>
                {
                    crate::error::CapacityError::too_many_subscriptions(status).into()
                }
                    other => SubscriptionError::creation_failed(other.to_string()).into(),
                }
            })?;
        *subscription_slot.lock() = id;
        Ok(id)
    }

    async fn create_monitored_items(
        &self,
        channel: ChannelHandle,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> SessionResult<Vec<MonitoredItemResult>> {
        let handles: Vec<u32> = items.iter().map(|i| i.client_handle).collect();
        let requests: Vec<MonitoredItemCreateRequest> = items
            .iter()
            .map(|item| MonitoredItemCreateRequest {
                item_to_monitor: read_value_id(&item.node_id),
                monitoring_mode: MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters {
                    client_handle: item.client_handle,
                    sampling_interval: item.sampling_interval.as_millis() as f64,
                    filter: ExtensionObject::null(),
                    queue_size: item.queue_size,
                    discard_oldest: true,
                },
            })
            .collect();

        let results = self
            .blocking(channel, "CreateMonitoredItems", move |s| {
                s.create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
            })
            .await?;

        Ok(handles
            .into_iter()
            .zip(results)
            .map(|(client_handle, result)| MonitoredItemResult {
                client_handle,
                status: StatusCode(result.status_code.bits()),
                server_item_id: result.monitored_item_id,
            })
            .collect())
    }

    async fn delete_subscription(&self, channel: ChannelHandle, subscription_id: u32) -> SessionResult<()> {
        self.blocking(channel, "DeleteSubscriptions", move |s| {
            s.delete_subscription(subscription_id)
        })
        .await
        .map(|_| ())
    }

    async fn transfer_subscription(&self, _channel: ChannelHandle, _subscription_id: u32) -> SessionResult<()> {
        Err(TransferError::unsupported("opcua").into())
    }

    fn events(&self) -> broadcast::Receiver<FacadeEvent> {
        self.events.subscribe()
    }

    fn display_name(&self) -> String {
        "opcua".to_string()
    }
}

impl std::fmt::Debug for OpcUaFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcUaFacade")
            .field("pki_dir", &self.pki_dir)
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn map_status(service: &str, status: opcua::types::StatusCode) -> SessionError {
    let status = StatusCode(status.bits());
    if status == StatusCode::BAD_SESSION_CLOSED
        || status == StatusCode::BAD_NOT_CONNECTED
        || status == StatusCode::BAD_COMMUNICATION_ERROR
    {
        ConnectionError::closed(format!("{service}: {status}")).into()
    } else if status == StatusCode::BAD_TIMEOUT {
        crate::error::TimeoutError::request(service, Duration::ZERO).into()
    } else {
        OperationError::service_fault(service, status).into()
    }
}

fn browse_description(node: &NodeId) -> BrowseDescription {
    BrowseDescription {
        node_id: to_opcua_node_id(node),
        browse_direction: BrowseDirection::Forward,
        reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
        include_subtypes: true,
        node_class_mask: 0,
        result_mask: BrowseDescriptionResultMask::all().bits(),
    }
}

fn read_value_id(node: &NodeId) -> ReadValueId {
    ReadValueId {
        node_id: to_opcua_node_id(node),
        attribute_id: AttributeId::Value as u32,
        index_range: opcua::types::UAString::null(),
        data_encoding: opcua::types::QualifiedName::null(),
    }
}

fn from_reference(reference: &opcua::types::ReferenceDescription) -> Option<ReferenceDescription> {
    // Targets on other servers are not walked.
    if reference.node_id.server_index != 0 {
        return None;
    }
    let type_definition = from_opcua_node_id(&reference.type_definition.node_id);
    Some(ReferenceDescription {
        node_id: from_opcua_node_id(&reference.node_id.node_id),
        browse_name: reference.browse_name.name.as_ref().to_string(),
        display_name: reference.display_name.text.as_ref().to_string(),
        node_class: NodeClass::from_value(reference.node_class as u32)?,
        type_definition: (!type_definition.is_null()).then_some(type_definition),
    })
}

fn to_opcua_node_id(node: &NodeId) -> opcua::types::NodeId {
    let ns = node.namespace_index;
    match &node.identifier {
        NodeIdentifier::Numeric(v) => opcua::types::NodeId::new(ns, *v),
        NodeIdentifier::String(v) => opcua::types::NodeId::new(ns, v.clone()),
        NodeIdentifier::Guid(v) => opcua::types::NodeId::new(ns, opcua::types::Guid::from(*v)),
        NodeIdentifier::Opaque(v) => {
            opcua::types::NodeId::new(ns, opcua::types::ByteString::from(v.as_slice()))
        }
    }
}

fn from_opcua_node_id(node: &opcua::types::NodeId) -> NodeId {
    let ns = node.namespace;
    match &node.identifier {
        opcua::types::Identifier::Numeric(v) => NodeId::numeric(ns, *v),
        opcua::types::Identifier::String(v) => NodeId::string(ns, v.as_ref()),
        opcua::types::Identifier::Guid(v) => NodeId::guid(ns, uuid::Uuid::from_bytes(*v.as_bytes())),
        opcua::types::Identifier::ByteString(v) => NodeId::opaque(ns, v.value.clone().unwrap_or_default()),
    }
}

fn to_chrono(t: &opcua::types::DateTime) -> chrono::DateTime<chrono::Utc> {
    t.as_chrono()
}

fn from_data_value(value: &opcua::types::DataValue) -> DataValue {
    DataValue {
        value: value.value.as_ref().map(from_variant),
        status: value
            .status
            .map(|s| StatusCode(s.bits()))
            .unwrap_or(StatusCode::GOOD),
        source_timestamp: value.source_timestamp.as_ref().map(to_chrono),
        server_timestamp: value.server_timestamp.as_ref().map(to_chrono),
    }
}

fn from_variant(variant: &Variant) -> UaValue {
    match variant {
        Variant::Empty => UaValue::Null,
        Variant::Boolean(v) => UaValue::Boolean(*v),
        Variant::SByte(v) => UaValue::Int32(*v as i32),
        Variant::Byte(v) => UaValue::UInt32(*v as u32),
        Variant::Int16(v) => UaValue::Int32(*v as i32),
        Variant::UInt16(v) => UaValue::UInt32(*v as u32),
        Variant::Int32(v) => UaValue::Int32(*v),
        Variant::UInt32(v) => UaValue::UInt32(*v),
        Variant::Int64(v) => UaValue::Int64(*v),
        Variant::UInt64(v) => UaValue::UInt64(*v),
        Variant::Float(v) => UaValue::Float(*v),
        Variant::Double(v) => UaValue::Double(*v),
        Variant::String(v) => UaValue::String(v.as_ref().to_string()),
        Variant::DateTime(v) => UaValue::DateTime(v.as_chrono()),
        Variant::ByteString(v) => UaValue::ByteString(v.value.clone().unwrap_or_default()),
        Variant::Array(array) => UaValue::Array(array.values.iter().map(from_variant).collect()),
        other => UaValue::String(format!("{other:?}")),
    }
}

fn to_variant(value: &UaValue) -> Variant {
    match value {
        UaValue::Null => Variant::Empty,
        UaValue::Boolean(v) => Variant::Boolean(*v),
        UaValue::Int32(v) => Variant::Int32(*v),
        UaValue::UInt32(v) => Variant::UInt32(*v),
        UaValue::Int64(v) => Variant::Int64(*v),
        UaValue::UInt64(v) => Variant::UInt64(*v),
        UaValue::Float(v) => Variant::Float(*v),
        UaValue::Double(v) => Variant::Double(*v),
        UaValue::String(v) => Variant::String(opcua::types::UAString::from(v.as_str())),
        UaValue::DateTime(v) => Variant::DateTime(Box::new(opcua::types::DateTime::from(*v))),
        UaValue::ByteString(v) => Variant::ByteString(opcua::types::ByteString::from(v.as_slice())),
        UaValue::Array(values) => {
            let variants: Vec<Variant> = values.iter().map(to_variant).collect();
            Variant::from(variants)
        }
    }
}
