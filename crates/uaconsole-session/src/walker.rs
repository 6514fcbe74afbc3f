// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Address-space traversal.
//!
//! # Strategies
//!
//! ```text
//! Full     one parent per round trip, breadth first      O(nodes) round trips
//! Managed  up to `batch_size` parents per round trip      O(nodes / batch) round trips
//! Cached   one node-cache snapshot, no traversal here     1 fetch
//! ```
//!
//! Every strategy returns the same [`WalkResult`] shape. The remote graph is
//! not a tree (back-references, shared children), so each node is yielded at
//! most once.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{BrowseError, SessionResult};
use crate::output::OutputSink;
use crate::session::facade::{BrowseResponse, ChannelHandle, ServerLimits, SessionFacade, SharedFacade};
use crate::types::{NodeId, NodeRef, StatusCode};

// =============================================================================
// BrowseStrategy
// =============================================================================

/// How to traverse the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowseStrategy {
    /// Recursive browse, one parent per round trip.
    Full,
    /// Batched browse.
    Managed {
        /// Parents per round trip.
        batch_size: usize,
    },
    /// Node cache snapshot.
    Cached,
}

impl fmt::Display for BrowseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full browse"),
            Self::Managed { batch_size } => write!(f, "managed browse (batch {batch_size})"),
            Self::Cached => write!(f, "node cache fetch"),
        }
    }
}

// =============================================================================
// WalkResult
// =============================================================================

/// Nodes discovered by one walk.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkResult {
    /// Strategy that produced the result.
    pub strategy: BrowseStrategy,
    /// Discovered nodes in discovery order, root excluded.
    pub nodes: Vec<NodeRef>,
    /// Remote calls made.
    pub round_trips: usize,
    /// References to nodes that had already been yielded.
    pub duplicates_skipped: usize,
    /// Parents whose browse returned a bad status.
    pub failed_parents: usize,
    /// Wall time of the walk.
    pub elapsed: Duration,
}

impl WalkResult {
    /// Variables accepted by `filter`.
    pub fn variables(&self, filter: VariableFilter) -> Vec<NodeRef> {
        filter_variables(&self.nodes, filter)
    }
}

/// Filter for variables with non-standard types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableFilter {
    /// Variables whose type definition lives outside namespace 0.
    CustomTypeDefinition,
    /// Variables whose data type lives outside namespace 0.
    CustomDataType,
}

/// Keeps variables accepted by `filter`.
///
/// A variable without the relevant type information is not accepted.
pub fn filter_variables(nodes: &[NodeRef], filter: VariableFilter) -> Vec<NodeRef> {
    nodes
        .iter()
        .filter(|n| n.is_variable())
        .filter(|n| {
            let type_ref = match filter {
                VariableFilter::CustomTypeDefinition => n.type_definition.as_ref(),
                VariableFilter::CustomDataType => n.data_type.as_ref(),
            };
            type_ref.is_some_and(|t| t.namespace_index != 0)
        })
        .cloned()
        .collect()
}

/// Picks the canonical result when both browse strategies may have run.
///
/// A full browse always wins; the managed result is used only when no full
/// browse was run. The two are never merged.
pub fn canonical(full: Option<WalkResult>, managed: Option<WalkResult>) -> Option<WalkResult> {
    full.or(managed)
}

// =============================================================================
// AddressSpaceWalker
// =============================================================================

/// Traverses the remote address space.
pub struct AddressSpaceWalker<F: SessionFacade> {
    facade: Arc<SharedFacade<F>>,
    output: Arc<dyn OutputSink>,
    stats: WalkerStats,
}

impl<F: SessionFacade> AddressSpaceWalker<F> {
    /// Creates a walker.
    pub fn new(facade: Arc<SharedFacade<F>>, output: Arc<dyn OutputSink>) -> Self {
        Self {
            facade,
            output,
            stats: WalkerStats::default(),
        }
    }

    /// Statistics over all walks.
    pub fn stats(&self) -> &WalkerStats {
        &self.stats
    }

    /// Walks the address space below `root`.
    ///
    /// # Errors
    ///
    /// `BrowseError::NodeNotFound` if the root does not exist; any error of
    /// a failed round trip otherwise.
    pub async fn walk(
        &self,
        channel: ChannelHandle,
        root: &NodeId,
        strategy: BrowseStrategy,
    ) -> SessionResult<WalkResult> {
        let started = Instant::now();
        tracing::debug!(root = %root, strategy = %strategy, "Address space walk started");

        let mut result = match strategy {
            BrowseStrategy::Full => self.walk_full(channel, root).await?,
            BrowseStrategy::Managed { batch_size } => self.walk_managed(channel, root, batch_size).await?,
            BrowseStrategy::Cached => self.walk_cached(channel, root).await?,
        };
        result.elapsed = started.elapsed();

        self.stats.record(&result);
        self.output.write_line(&format!(
            "{} found {} nodes in {} round trips ({} ms).",
            capitalize(&strategy.to_string()),
            result.nodes.len(),
            result.round_trips,
            result.elapsed.as_millis()
        ));
        tracing::info!(
            strategy = %strategy,
            nodes = result.nodes.len(),
            round_trips = result.round_trips,
            duplicates = result.duplicates_skipped,
            failed_parents = result.failed_parents,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Address space walk completed"
        );

        Ok(result)
    }

    async fn walk_full(&self, channel: ChannelHandle, root: &NodeId) -> SessionResult<WalkResult> {
        let mut walk = Traversal::new(BrowseStrategy::Full, root);
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(parent) = queue.pop_front() {
            let responses = self.facade.browse(channel, std::slice::from_ref(&parent)).await?;
            walk.round_trips += 1;
            for child in walk.absorb(root, responses)? {
                queue.push_back(child);
            }
        }

        Ok(walk.finish())
    }

    async fn walk_managed(
        &self,
        channel: ChannelHandle,
        root: &NodeId,
        batch_size: usize,
    ) -> SessionResult<WalkResult> {
        let limits = self.facade.server_limits(channel).await?;
        let batch = ServerLimits::clamp(limits.max_nodes_per_browse, batch_size.max(1));

        let mut walk = Traversal::new(BrowseStrategy::Managed { batch_size: batch }, root);
        let mut frontier = vec![root.clone()];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for parents in frontier.chunks(batch) {
                let responses = self.facade.browse(channel, parents).await?;
                walk.round_trips += 1;
                next.extend(walk.absorb(root, responses)?);
            }
            frontier = next;
        }

        Ok(walk.finish())
    }

    async fn walk_cached(&self, channel: ChannelHandle, root: &NodeId) -> SessionResult<WalkResult> {
        let snapshot = self.facade.fetch_node_cache(channel, root).await?;

        let mut walk = Traversal::new(BrowseStrategy::Cached, root);
        walk.round_trips = 1;
        for node in snapshot {
            if node.node_id == *root {
                continue;
            }
            walk.push(node);
        }
        Ok(walk.finish())
    }
}

impl<F: SessionFacade> fmt::Debug for AddressSpaceWalker<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceWalker")
            .field("walks", &self.stats.walks())
            .finish()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// =============================================================================
// Traversal
// =============================================================================

/// Dedup bookkeeping shared by the browsing strategies.
struct Traversal {
    strategy: BrowseStrategy,
    visited: HashSet<NodeId>,
    nodes: Vec<NodeRef>,
    round_trips: usize,
    duplicates_skipped: usize,
    failed_parents: usize,
}

impl Traversal {
    fn new(strategy: BrowseStrategy, root: &NodeId) -> Self {
        Self {
            strategy,
            visited: HashSet::from([root.clone()]),
            nodes: Vec::new(),
            round_trips: 0,
            duplicates_skipped: 0,
            failed_parents: 0,
        }
    }

    /// Records one node; returns `true` if it was new.
    fn push(&mut self, node: NodeRef) -> bool {
        if self.visited.insert(node.node_id.clone()) {
            self.nodes.push(node);
            true
        } else {
            self.duplicates_skipped += 1;
            false
        }
    }

    /// Records a browse response and returns the new children to expand.
    fn absorb(&mut self, root: &NodeId, responses: Vec<BrowseResponse>) -> SessionResult<Vec<NodeId>> {
        let mut children = Vec::new();

        for response in responses {
            if response.status.is_bad() {
                if response.parent == *root && response.status == StatusCode::BAD_NODE_ID_UNKNOWN {
                    return Err(BrowseError::node_not_found(root.to_string()).into());
                }
                self.failed_parents += 1;
                tracing::debug!(parent = %response.parent, status = %response.status, "Browse of parent failed");
                continue;
            }

            for reference in &response.references {
                let node = reference.to_node_ref();
                let id = node.node_id.clone();
                if self.push(node) {
                    children.push(id);
                }
            }
        }

        Ok(children)
    }

    fn finish(self) -> WalkResult {
        WalkResult {
            strategy: self.strategy,
            nodes: self.nodes,
            round_trips: self.round_trips,
            duplicates_skipped: self.duplicates_skipped,
            failed_parents: self.failed_parents,
            elapsed: Duration::ZERO,
        }
    }
}

// =============================================================================
// WalkerStats
// =============================================================================

/// Counters over all walks of a walker.
#[derive(Debug, Default)]
pub struct WalkerStats {
    walks: AtomicU64,
    round_trips: AtomicU64,
    nodes_discovered: AtomicU64,
    duplicates_skipped: AtomicU64,
}

impl WalkerStats {
    fn record(&self, result: &WalkResult) {
        self.walks.fetch_add(1, Ordering::Relaxed);
        self.round_trips
            .fetch_add(result.round_trips as u64, Ordering::Relaxed);
        self.nodes_discovered
            .fetch_add(result.nodes.len() as u64, Ordering::Relaxed);
        self.duplicates_skipped
            .fetch_add(result.duplicates_skipped as u64, Ordering::Relaxed);
    }

    /// Completed walks.
    pub fn walks(&self) -> u64 {
        self.walks.load(Ordering::Relaxed)
    }

    /// Remote calls over all walks.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Nodes yielded over all walks.
    pub fn nodes_discovered(&self) -> u64 {
        self.nodes_discovered.load(Ordering::Relaxed)
    }

    /// Duplicates skipped over all walks.
    pub fn duplicates_skipped(&self) -> u64 {
        self.duplicates_skipped.load(Ordering::Relaxed)
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
    use crate::types::{EndpointTarget, NodeClass};

    async fn walker_on(
        server: &SimulatedServer,
    ) -> (AddressSpaceWalker<SimulatedServer>, ChannelHandle, MemorySink) {
        let facade = Arc::new(SharedFacade::new(server.clone()));
        let channel = facade
            .open(&EndpointTarget::new("opc.tcp://sim"), Duration::from_secs(1))
            .await
            .unwrap();
        let sink = MemorySink::new();
        (AddressSpaceWalker::new(facade, Arc::new(sink.clone())), channel, sink)
    }

    fn ids(result: &WalkResult) -> HashSet<NodeId> {
        result.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_full_browse_never_repeats() {
        let server = SimulatedServer::new();
        let (walker, channel, sink) = walker_on(&server).await;

        let result = walker
            .walk(channel, &NodeId::ROOT_FOLDER, BrowseStrategy::Full)
            .await
            .unwrap();

        assert_eq!(ids(&result).len(), result.nodes.len());
        assert!(result.duplicates_skipped > 0, "graph has back-references");
        assert!(!result.nodes.iter().any(|n| n.node_id == NodeId::ROOT_FOLDER));
        assert_eq!(result.round_trips, result.nodes.len() + 1);
        assert!(sink.contains("Full browse found"));
    }

    #[tokio::test]
    async fn test_strategies_agree() {
        let server = SimulatedServer::new();
        let (walker, channel, _) = walker_on(&server).await;

        let full = walker
            .walk(channel, &NodeId::ROOT_FOLDER, BrowseStrategy::Full)
            .await
            .unwrap();
        let managed = walker
            .walk(channel, &NodeId::ROOT_FOLDER, BrowseStrategy::Managed { batch_size: 16 })
            .await
            .unwrap();
        let cached = walker
            .walk(channel, &NodeId::ROOT_FOLDER, BrowseStrategy::Cached)
            .await
            .unwrap();

        assert_eq!(ids(&full), ids(&managed));
        assert_eq!(ids(&full), ids(&cached));
        assert!(managed.round_trips < full.round_trips);
        assert_eq!(cached.round_trips, 1);
        assert_eq!(ids(&managed).len(), managed.nodes.len());
    }

    #[tokio::test]
    async fn test_managed_batch_respects_server_limit() {
        let server = SimulatedServer::new();
        server.set_limits(ServerLimits {
            max_nodes_per_browse: 4,
            ..ServerLimits::default()
        });
        let (walker, channel, _) = walker_on(&server).await;

        let result = walker
            .walk(channel, &NodeId::ROOT_FOLDER, BrowseStrategy::Managed { batch_size: 16 })
            .await
            .unwrap();
        assert_eq!(result.strategy, BrowseStrategy::Managed { batch_size: 4 });
        assert_eq!(server.largest_browse_request(), 4);
    }

    #[tokio::test]
    async fn test_unknown_root() {
        let server = SimulatedServer::new();
        let (walker, channel, _) = walker_on(&server).await;

        let err = walker
            .walk(channel, &NodeId::string(9, "Nowhere"), BrowseStrategy::Full)
            .await
            .unwrap_err();
        assert_eq!(err.error_code().to_string(), "UA-0601");
    }

    #[test]
    fn test_variable_filters() {
        let custom = NodeRef::new(NodeId::string(2, "A"), NodeClass::Variable, "A")
            .with_type_definition(NodeId::numeric(2, 1001));
        let base = NodeRef::new(NodeId::string(2, "B"), NodeClass::Variable, "B")
            .with_type_definition(NodeId::BASE_DATA_VARIABLE_TYPE)
            .with_data_type(NodeId::numeric(3, 3001));
        let object = NodeRef::new(NodeId::string(2, "C"), NodeClass::Object, "C")
            .with_type_definition(NodeId::numeric(2, 1002));
        let nodes = vec![custom, base, object];

        let by_type = filter_variables(&nodes, VariableFilter::CustomTypeDefinition);
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].browse_name, "A");

        let by_data_type = filter_variables(&nodes, VariableFilter::CustomDataType);
        assert_eq!(by_data_type.len(), 1);
        assert_eq!(by_data_type[0].browse_name, "B");
    }

    #[test]
    fn test_canonical_prefers_full() {
        let result = |strategy| WalkResult {
            strategy,
            nodes: Vec::new(),
            round_trips: 0,
            duplicates_skipped: 0,
            failed_parents: 0,
            elapsed: Duration::ZERO,
        };

        let picked = canonical(Some(result(BrowseStrategy::Full)), Some(result(BrowseStrategy::Cached)));
        assert_eq!(picked.map(|r| r.strategy), Some(BrowseStrategy::Full));

        let picked = canonical(None, Some(result(BrowseStrategy::Managed { batch_size: 2 })));
        assert_eq!(picked.map(|r| r.strategy), Some(BrowseStrategy::Managed { batch_size: 2 }));

        assert!(canonical(None, None).is_none());
    }
}
