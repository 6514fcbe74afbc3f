// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! One-shot Read, Write and Call services.
//!
//! Results are always per element. A failed round trip marks each element
//! of that round trip with a status derived from the error; the remaining
//! round trips of the batch still run.

use std::fmt;
use std::sync::Arc;

use super::facade::{ChannelHandle, SessionFacade, SharedFacade};
use crate::error::{SessionError, SessionResult};
use crate::types::{DataValue, NodeId, NodeRef, StatusCode, UaValue};

/// Default number of nodes per Read or Write round trip.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of reading one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    /// The node that was read.
    pub node: NodeRef,
    /// Value, status and timestamps.
    pub value: DataValue,
}

impl ReadOutcome {
    /// Status of this element.
    pub fn status(&self) -> StatusCode {
        self.value.status
    }

    /// Returns `true` if the read succeeded.
    pub fn is_good(&self) -> bool {
        self.value.status.is_good()
    }
}

impl fmt::Display for ReadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value.value {
            Some(value) if !self.value.status.is_bad() => write!(f, "{}", value),
            _ => write!(f, "{}", self.value.status),
        }
    }
}

/// Result of writing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The node that was written.
    pub node: NodeRef,
    /// Status of the write.
    pub status: StatusCode,
}

impl WriteOutcome {
    /// Returns `true` if the write succeeded.
    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }
}

/// Result of a method call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Object the method was called on.
    pub object: NodeId,
    /// The method.
    pub method: NodeId,
    /// Overall status.
    pub status: StatusCode,
    /// Output arguments; empty unless the call succeeded.
    pub outputs: Vec<UaValue>,
    /// Per input argument status.
    pub input_argument_results: Vec<StatusCode>,
}

impl CallOutcome {
    /// Returns `true` if the call succeeded.
    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }
}

// =============================================================================
// OneShot
// =============================================================================

/// Request/response services over a shared facade.
pub struct OneShot<F: SessionFacade> {
    facade: Arc<SharedFacade<F>>,
    batch_size: usize,
}

impl<F: SessionFacade> OneShot<F> {
    /// Creates the service helper.
    pub fn new(facade: Arc<SharedFacade<F>>) -> Self {
        Self {
            facade,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the number of nodes per round trip.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reads the value of every node.
    ///
    /// The result has exactly one entry per input node, in input order.
    pub async fn read_values(&self, channel: Option<ChannelHandle>, nodes: &[NodeRef]) -> Vec<ReadOutcome> {
        let mut outcomes = Vec::with_capacity(nodes.len());

        for chunk in nodes.chunks(self.batch_size) {
            let ids: Vec<NodeId> = chunk.iter().map(|n| n.node_id.clone()).collect();
            let result = match channel {
                Some(channel) => self.facade.read(channel, &ids).await,
                None => Err(SessionError::not_connected()),
            };

            match result {
                Ok(values) => {
                    let mut values = values.into_iter();
                    for node in chunk {
                        let value = values
                            .next()
                            .unwrap_or_else(|| DataValue::bad(StatusCode::BAD_UNEXPECTED_ERROR));
                        outcomes.push(ReadOutcome {
                            node: node.clone(),
                            value,
                        });
                    }
                }
                Err(e) => {
                    e.log("read");
                    let status = e.status_code();
                    outcomes.extend(chunk.iter().map(|node| ReadOutcome {
                        node: node.clone(),
                        value: DataValue::bad(status),
                    }));
                }
            }
        }

        tracing::debug!(
            nodes = nodes.len(),
            bad = outcomes.iter().filter(|o| !o.is_good()).count(),
            "Read completed"
        );
        outcomes
    }

    /// Reads one node.
    pub async fn read_value(&self, channel: Option<ChannelHandle>, node: &NodeRef) -> ReadOutcome {
        let mut outcomes = self.read_values(channel, std::slice::from_ref(node)).await;
        outcomes.pop().unwrap_or_else(|| ReadOutcome {
            node: node.clone(),
            value: DataValue::bad(StatusCode::BAD_UNEXPECTED_ERROR),
        })
    }

    /// Writes every value.
    ///
    /// The result has exactly one entry per input pair, in input order.
    pub async fn write_values(
        &self,
        channel: Option<ChannelHandle>,
        writes: &[(NodeRef, UaValue)],
    ) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(writes.len());

        for chunk in writes.chunks(self.batch_size) {
            let request: Vec<(NodeId, UaValue)> = chunk
                .iter()
                .map(|(node, value)| (node.node_id.clone(), value.clone()))
                .collect();
            let result = match channel {
                Some(channel) => self.facade.write(channel, &request).await,
                None => Err(SessionError::not_connected()),
            };

            match result {
                Ok(statuses) => {
                    let mut statuses = statuses.into_iter();
                    for (node, _) in chunk {
                        outcomes.push(WriteOutcome {
                            node: node.clone(),
                            status: statuses.next().unwrap_or(StatusCode::BAD_UNEXPECTED_ERROR),
                        });
                    }
                }
                Err(e) => {
                    e.log("write");
                    let status = e.status_code();
                    outcomes.extend(chunk.iter().map(|(node, _)| WriteOutcome {
                        node: node.clone(),
                        status,
                    }));
                }
            }
        }

        tracing::debug!(
            nodes = writes.len(),
            bad = outcomes.iter().filter(|o| !o.is_good()).count(),
            "Write completed"
        );
        outcomes
    }

    /// Calls `method` on `object`.
    pub async fn call_method(
        &self,
        channel: Option<ChannelHandle>,
        object: &NodeRef,
        method: &NodeRef,
        args: &[UaValue],
    ) -> CallOutcome {
        let result: SessionResult<_> = match channel {
            Some(channel) => {
                self.facade
                    .call(channel, &object.node_id, &method.node_id, args)
                    .await
            }
            None => Err(SessionError::not_connected()),
        };

        match result {
            Ok(response) => {
                tracing::debug!(method = %method.node_id, status = %response.status, "Call completed");
                CallOutcome {
                    object: object.node_id.clone(),
                    method: method.node_id.clone(),
                    status: response.status,
                    outputs: response.outputs,
                    input_argument_results: response.input_argument_results,
                }
            }
            Err(e) => {
                e.log("call");
                CallOutcome {
                    object: object.node_id.clone(),
                    method: method.node_id.clone(),
                    status: e.status_code(),
                    outputs: Vec::new(),
                    input_argument_results: Vec::new(),
                }
            }
        }
    }
}

impl<F: SessionFacade> fmt::Debug for OneShot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShot")
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sim::SimulatedServer;
    use crate::types::{EndpointTarget, NodeClass};

    async fn connected(server: &SimulatedServer) -> (OneShot<SimulatedServer>, ChannelHandle) {
        let facade = Arc::new(SharedFacade::new(server.clone()));
        let channel = facade
            .open(&EndpointTarget::new("opc.tcp://sim"), Duration::from_secs(1))
            .await
            .unwrap();
        (OneShot::new(facade), channel)
    }

    fn node(id: NodeId, class: NodeClass) -> NodeRef {
        NodeRef::new(id.clone(), class, id.to_string())
    }

    #[tokio::test]
    async fn test_read_reports_each_element() {
        let server = SimulatedServer::new();
        let (ops, channel) = connected(&server).await;

        let nodes = vec![
            node(NodeId::SERVER_STATUS_STATE, NodeClass::Variable),
            node(NodeId::string(2, "Missing"), NodeClass::Variable),
            node(NodeId::SERVER_STATUS_CURRENT_TIME, NodeClass::Variable),
        ];
        let outcomes = ops.read_values(Some(channel), &nodes).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_good());
        assert_eq!(outcomes[1].status(), StatusCode::BAD_NODE_ID_UNKNOWN);
        assert!(outcomes[2].is_good());
    }

    #[tokio::test]
    async fn test_failed_round_trip_does_not_abort_batch() {
        let server = SimulatedServer::new();
        let (ops, _) = connected(&server).await;
        let ops = ops.with_batch_size(2);

        let nodes: Vec<_> = (0..5)
            .map(|_| node(NodeId::SERVER_STATUS_STATE, NodeClass::Variable))
            .collect();
        let outcomes = ops.read_values(None, &nodes).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes
            .iter()
            .all(|o| o.status() == StatusCode::BAD_NOT_CONNECTED));
    }

    #[tokio::test]
    async fn test_write_mixed_results() {
        let server = SimulatedServer::new();
        let (ops, channel) = connected(&server).await;

        let writes = vec![
            (node(SimulatedServer::static_double(), NodeClass::Variable), UaValue::Double(42.5)),
            (node(SimulatedServer::static_double(), NodeClass::Variable), UaValue::String("x".into())),
            (node(NodeId::SERVER_STATUS_STATE, NodeClass::Variable), UaValue::Int32(0)),
        ];
        let outcomes = ops.write_values(Some(channel), &writes).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_good());
        assert_eq!(outcomes[1].status, StatusCode::BAD_TYPE_MISMATCH);
        assert_eq!(outcomes[2].status, StatusCode::BAD_NOT_WRITABLE);

        let read = ops
            .read_value(Some(channel), &writes[0].0)
            .await;
        assert_eq!(read.value.value, Some(UaValue::Double(42.5)));
    }

    #[tokio::test]
    async fn test_call_method() {
        let server = SimulatedServer::new();
        let (ops, channel) = connected(&server).await;
        let object = node(SimulatedServer::methods_folder(), NodeClass::Object);
        let method = node(SimulatedServer::multiply_method(), NodeClass::Method);

        let outcome = ops
            .call_method(
                Some(channel),
                &object,
                &method,
                &[UaValue::Double(6.0), UaValue::Double(7.0)],
            )
            .await;
        assert!(outcome.is_good());
        assert_eq!(outcome.outputs, vec![UaValue::Double(42.0)]);

        let outcome = ops
            .call_method(Some(channel), &object, &method, &[UaValue::Double(6.0)])
            .await;
        assert_eq!(outcome.status, StatusCode::BAD_ARGUMENTS_MISSING);
        assert!(outcome.outputs.is_empty());
    }
}
