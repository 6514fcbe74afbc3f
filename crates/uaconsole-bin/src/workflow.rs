// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The client workflow.
//!
//! ```text
//! connect ─► samples ─► walk ─► [json values] ─► [subscribe] ─► monitor ─► disconnect
//!                                                     │
//!                                          round-robin value reader
//! ```
//!
//! Everything goes through one [`SessionLifecycleController`]; the workflow
//! only decides what to run and prints results to the output sink.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use uaconsole_session::session::{select_sample, subscription_candidates, OutputCallback};
use uaconsole_session::{
    canonical, BrowseStrategy, ClientConfig, ConsoleSink, NodeClass, NodeId, NodeRef, OutputSink, QuitSignal,
    SessionFacade, SessionLifecycleController, SimulatedServer, SubscriptionSpec, TeeSink, TerminationReason,
    UaValue, VariableFilter, WalkResult,
};

use crate::cli::Cli;
use crate::error::{BinError, BinResult};

/// Period of the round-robin value reader.
pub const POLL_PERIOD: Duration = Duration::from_millis(500);

/// Variables read per request of the value dump.
pub const VALUE_BATCH: usize = 100;

// =============================================================================
// Entry
// =============================================================================

/// Runs the client for parsed CLI arguments until `quit` is raised or the
/// deadline elapses.
pub async fn run(cli: &Cli, quit: QuitSignal) -> BinResult<()> {
    let config = cli.to_config().map_err(|e| BinError::config(e.to_string()))?;
    let output = console_output(cli.quiet);

    if cli.simulate {
        info!("Using the simulated server");
        return run_with(SimulatedServer::new(), config, output, quit).await;
    }

    #[cfg(feature = "real-transport")]
    {
        let facade = uaconsole_session::session::OpcUaFacade::new("pki");
        run_with(facade, config, output, quit).await
    }

    #[cfg(not(feature = "real-transport"))]
    {
        warn!("Built without the real-transport feature, using the simulated server");
        run_with(SimulatedServer::new(), config, output, quit).await
    }
}

/// Console output unless quiet; an empty tee discards every line.
pub fn console_output(quiet: bool) -> Arc<dyn OutputSink> {
    let tee = TeeSink::new();
    if quiet {
        Arc::new(tee)
    } else {
        Arc::new(tee.with(Arc::new(ConsoleSink::new())))
    }
}

/// Runs the whole workflow against `facade`.
///
/// # Errors
///
/// - `Connection` when the first connect fails
/// - `Fatal` when the session failed during monitoring
pub async fn run_with<F: SessionFacade>(
    facade: F,
    config: ClientConfig,
    output: Arc<dyn OutputSink>,
    quit: QuitSignal,
) -> BinResult<()> {
    let controller = Arc::new(SessionLifecycleController::new(facade, config.clone(), output.clone()));

    controller
        .connect(config.endpoint.clone())
        .await
        .map_err(|e| BinError::connection(e.to_string()))?;

    let result = drive(&controller, &config, &output, &quit).await;

    if let Err(e) = controller.disconnect().await {
        e.log("disconnect");
    }
    output.write_line("Client disconnected.");

    let stats = controller.stats().snapshot();
    info!(
        connects = stats.connects,
        reconnects = stats.reconnects,
        reconnect_attempts = stats.reconnect_attempts,
        transfers = stats.transfers,
        transfer_failures = stats.transfer_failures,
        notifications = stats.notifications,
        keep_alive_timeouts = stats.keep_alive_timeouts,
        "Session statistics"
    );

    match result? {
        TerminationReason::FatalError => Err(BinError::fatal("the session could not be recovered")),
        _ => Ok(()),
    }
}

async fn drive<F: SessionFacade>(
    controller: &Arc<SessionLifecycleController<F>>,
    config: &ClientConfig,
    output: &Arc<dyn OutputSink>,
    quit: &QuitSignal,
) -> BinResult<TerminationReason> {
    run_samples(controller, output.as_ref()).await;

    let walked = walk(controller, config, output.as_ref()).await;

    if config.browse.json_values {
        if let Some(variables) = walked.dump_set() {
            dump_values(controller, &variables, output.as_ref()).await;
        }
    }

    let mut reader = None;
    if config.subscribe {
        let nodes = match walked.into_nodes() {
            Some(nodes) => nodes,
            None => {
                let strategy = BrowseStrategy::Managed {
                    batch_size: config.browse.managed_batch_size,
                };
                controller.browse(&NodeId::ROOT_FOLDER, strategy).await?.nodes
            }
        };
        let sample = select_sample(
            &subscription_candidates(&nodes),
            config.subscription.max_variables,
            config.subscription.seed,
        );
        if sample.is_empty() {
            output.write_line("No variables to subscribe to.");
        } else {
            output.write_line(&format!("Subscribing to {} variables.", sample.len()));
            let spec = SubscriptionSpec::from_defaults(&config.subscription)
                .add_nodes(sample.iter().cloned())
                .build()?;
            controller.subscribe(spec).await?;
            if config.verbose {
                controller.set_notification_callback(Arc::new(OutputCallback::new(output.clone())));
            }
            reader = Some(spawn_reader(controller.clone(), sample, output.clone()));
        }
    }

    let reason = controller.monitor(quit).await;

    if let Some((stop, handle)) = reader {
        stop.raise();
        if let Err(e) = handle.await {
            warn!(error = %e, "Value reader task failed");
        }
    }

    Ok(reason?)
}

// =============================================================================
// Samples
// =============================================================================

/// Read, write, browse and call samples run right after connecting.
pub async fn run_samples<F: SessionFacade>(controller: &SessionLifecycleController<F>, output: &dyn OutputSink) {
    let status_nodes = [
        NodeRef::new(NodeId::SERVER_STATUS, NodeClass::Variable, "ServerStatus"),
        NodeRef::new(NodeId::SERVER_STATUS_CURRENT_TIME, NodeClass::Variable, "CurrentTime"),
        NodeRef::new(NodeId::SERVER_STATUS_STATE, NodeClass::Variable, "State"),
    ];
    for outcome in controller.read_values(&status_nodes).await {
        output.write_line(&format!("{} is {}", outcome.node.browse_name, outcome));
    }

    let writes = [
        (
            NodeRef::new(SimulatedServer::static_double(), NodeClass::Variable, "Double"),
            UaValue::Double(42.5),
        ),
        (
            NodeRef::new(NodeId::string(2, "Demo.Static.Int32"), NodeClass::Variable, "Int32"),
            UaValue::Int32(-7),
        ),
        (
            NodeRef::new(NodeId::string(2, "Demo.Static.String"), NodeClass::Variable, "String"),
            UaValue::String("uaconsole".to_string()),
        ),
    ];
    for outcome in controller.write_values(&writes).await {
        output.write_line(&format!("Write {}: {}", outcome.node.node_id, outcome.status));
    }

    match controller.browse(&NodeId::SERVER, BrowseStrategy::Full).await {
        Ok(result) => output.write_line(&format!("Server object has {} nodes.", result.nodes.len())),
        Err(e) => output.write_line(&format!("Browse of the Server object failed: {e}")),
    }

    let object = NodeRef::new(SimulatedServer::methods_folder(), NodeClass::Object, "Methods");
    let method = NodeRef::new(SimulatedServer::multiply_method(), NodeClass::Method, "Multiply");
    let call = controller
        .call_method(&object, &method, &[UaValue::Double(3.0), UaValue::Double(7.0)])
        .await;
    if call.is_good() {
        let outputs: Vec<String> = call.outputs.iter().map(ToString::to_string).collect();
        output.write_line(&format!("Multiply(3, 7) returned [{}]", outputs.join(", ")));
    } else {
        output.write_line(&format!("Multiply failed: {}", call.status));
    }
}

// =============================================================================
// Walk
// =============================================================================

/// Results of the requested walks.
#[derive(Debug, Default)]
pub struct Walked {
    /// Canonical browse result, full over managed.
    pub browsed: Option<WalkResult>,
    /// Node cache snapshot, when it was fetched.
    pub cached: Option<WalkResult>,
}

impl Walked {
    /// Variables of the JSON value dump.
    ///
    /// The cache snapshot, filtered on custom data types, replaces the browse
    /// set filtered on custom type definitions.
    pub fn dump_set(&self) -> Option<Vec<NodeRef>> {
        match (&self.cached, &self.browsed) {
            (Some(cached), _) => Some(cached.variables(VariableFilter::CustomDataType)),
            (None, Some(browsed)) => Some(browsed.variables(VariableFilter::CustomTypeDefinition)),
            (None, None) => None,
        }
    }

    /// Nodes subscription candidates are drawn from, cache snapshot first.
    pub fn into_nodes(self) -> Option<Vec<NodeRef>> {
        self.cached.or(self.browsed).map(|result| result.nodes)
    }
}

/// Runs every requested strategy from the root folder.
pub async fn walk<F: SessionFacade>(
    controller: &SessionLifecycleController<F>,
    config: &ClientConfig,
    output: &dyn OutputSink,
) -> Walked {
    let plan = &config.browse;
    let mut strategies = Vec::new();
    if plan.full_browse {
        strategies.push(BrowseStrategy::Full);
    }
    if plan.managed_browse {
        strategies.push(BrowseStrategy::Managed {
            batch_size: plan.managed_batch_size,
        });
    }
    if plan.fetch_all {
        strategies.push(BrowseStrategy::Cached);
    }

    let (mut full, mut managed, mut cached) = (None, None, None);
    for strategy in strategies {
        match controller.browse(&NodeId::ROOT_FOLDER, strategy).await {
            Ok(result) => {
                output.write_line(&format!(
                    "{}: {} nodes, {} variables with custom types, {} round trips in {:?}.",
                    strategy,
                    result.nodes.len(),
                    result.variables(VariableFilter::CustomTypeDefinition).len(),
                    result.round_trips,
                    result.elapsed
                ));
                match strategy {
                    BrowseStrategy::Full => full = Some(result),
                    BrowseStrategy::Managed { .. } => managed = Some(result),
                    BrowseStrategy::Cached => cached = Some(result),
                }
            }
            Err(e) => output.write_line(&format!("{strategy} failed: {e}")),
        }
    }

    Walked {
        browsed: canonical(full, managed),
        cached,
    }
}

// =============================================================================
// Value dump
// =============================================================================

/// Reads every variable in batches and prints one JSON object per value.
pub async fn dump_values<F: SessionFacade>(
    controller: &SessionLifecycleController<F>,
    variables: &[NodeRef],
    output: &dyn OutputSink,
) {
    for batch in variables.chunks(VALUE_BATCH) {
        for outcome in controller.read_values(batch).await {
            let value = outcome
                .value
                .value
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok())
                .unwrap_or(serde_json::Value::Null);
            let line = json!({
                "node": outcome.node.node_id.to_opc_string(),
                "value": value,
                "status": format!("0x{:08X}", outcome.value.status.0),
                "source_timestamp": outcome.value.source_timestamp.map(|t| t.to_rfc3339()),
            });
            output.write_line(&line.to_string());
        }
    }
}

// =============================================================================
// Round-robin reader
// =============================================================================

/// Reads one sampled variable per [`POLL_PERIOD`] until the returned signal
/// is raised.
pub fn spawn_reader<F: SessionFacade>(
    controller: Arc<SessionLifecycleController<F>>,
    variables: Vec<NodeRef>,
    output: Arc<dyn OutputSink>,
) -> (QuitSignal, JoinHandle<()>) {
    let stop = QuitSignal::new();
    let observed = stop.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = interval(POLL_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for node in variables.iter().cycle() {
            ticker.tick().await;
            if observed.is_raised() {
                break;
            }
            let outcome = controller.read_values(std::slice::from_ref(node)).await;
            match outcome.first() {
                Some(read) if read.is_good() => {
                    output.write_line(&format!("Value of {} is {}", node.node_id, read));
                }
                Some(read) => {
                    output.write_line(&format!("Error reading value of {}: {}", node.node_id, read.value.status));
                }
                None => {}
            }
        }
    });

    (stop, handle)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uaconsole_session::MemorySink;

    fn config(deadline: Duration) -> uaconsole_session::ClientConfigBuilder {
        ClientConfig::builder()
            .endpoint("opc.tcp://sim:4840")
            .use_security(false)
            .deadline(Some(deadline))
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_and_disconnect() {
        let sink = Arc::new(MemorySink::new());
        let config = config(Duration::from_secs(2)).build().unwrap();

        run_with(SimulatedServer::new(), config, sink.clone(), QuitSignal::new())
            .await
            .unwrap();

        assert!(sink.contains("CurrentTime is"));
        assert!(sink.contains("Multiply(3, 7) returned [21]"));
        assert!(sink.contains("Monitoring ended: deadline exceeded"));
        assert_eq!(sink.lines().last().map(String::as_str), Some("Client disconnected."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_with_reader() {
        let server = SimulatedServer::with_plant_variables(40);
        let sink = Arc::new(MemorySink::new());
        let config = config(Duration::from_secs(3))
            .subscribe(true)
            .build()
            .unwrap();

        run_with(server.clone(), config, sink.clone(), QuitSignal::new())
            .await
            .unwrap();

        assert!(sink.contains("Subscribing to"));
        assert!(!sink.lines_containing("Value of ").is_empty());
        assert_eq!(server.subscription_count(), 0);
    }

    fn json_nodes(sink: &MemorySink) -> Vec<String> {
        sink.lines()
            .iter()
            .filter(|l| l.starts_with('{'))
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter_map(|v| v["node"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_values_follow_type_definition_filter() {
        let sink = Arc::new(MemorySink::new());
        let plan = uaconsole_session::BrowsePlan {
            managed_browse: true,
            json_values: true,
            ..Default::default()
        };
        let config = config(Duration::from_secs(1)).browse(plan).build().unwrap();

        run_with(SimulatedServer::with_plant_variables(5), config, sink.clone(), QuitSignal::new())
            .await
            .unwrap();

        let nodes = json_nodes(&sink);
        // Five plant variables plus the two boiler variables.
        assert_eq!(nodes.len(), 7);
        assert!(nodes.iter().all(|n| n.starts_with("ns=")));
        assert!(!nodes.iter().any(|n| n.contains("Demo.Static") || n.contains("Demo.Custom")));
        assert!(sink
            .lines()
            .iter()
            .filter(|l| l.starts_with('{'))
            .all(|l| l.contains("\"status\":\"0x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_snapshot_replaces_browse_set() {
        let sink = Arc::new(MemorySink::new());
        let plan = uaconsole_session::BrowsePlan {
            managed_browse: true,
            fetch_all: true,
            json_values: true,
            ..Default::default()
        };
        let config = config(Duration::from_secs(1)).browse(plan).build().unwrap();

        run_with(SimulatedServer::with_plant_variables(5), config, sink.clone(), QuitSignal::new())
            .await
            .unwrap();

        let nodes = json_nodes(&sink);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].contains("Demo.Custom.Struct"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_starts_at_root_folder() {
        let server = SimulatedServer::with_plant_variables(3);
        let sink = Arc::new(MemorySink::new());
        let plan = uaconsole_session::BrowsePlan {
            full_browse: true,
            ..Default::default()
        };
        let config = config(Duration::from_secs(1)).browse(plan).build().unwrap();
        let controller = SessionLifecycleController::new(server, config.clone(), sink.clone());
        controller.connect(config.endpoint.clone()).await.unwrap();

        let walked = walk(&controller, &config, sink.as_ref()).await;
        assert!(walked.cached.is_none());
        let browsed = walked.browsed.unwrap();
        assert!(browsed.nodes.iter().any(|n| n.node_id == NodeId::OBJECTS_FOLDER));
        assert!(!browsed.nodes.iter().any(|n| n.node_id == NodeId::ROOT_FOLDER));
        controller.disconnect().await.unwrap();
    }

    #[test]
    fn test_walked_prefers_cache_snapshot() {
        let result = |strategy, nodes: Vec<NodeRef>| WalkResult {
            strategy,
            nodes,
            round_trips: 1,
            duplicates_skipped: 0,
            failed_parents: 0,
            elapsed: Duration::ZERO,
        };
        let browsed_node = NodeRef::new(NodeId::string(3, "Browsed"), NodeClass::Variable, "Browsed")
            .with_type_definition(NodeId::numeric(3, 2001));
        let cached_node = NodeRef::new(NodeId::string(2, "Cached"), NodeClass::Variable, "Cached")
            .with_data_type(NodeId::numeric(2, 3001));

        let browse_only = Walked {
            browsed: Some(result(BrowseStrategy::Full, vec![browsed_node.clone()])),
            cached: None,
        };
        assert_eq!(browse_only.dump_set(), Some(vec![browsed_node.clone()]));

        let both = Walked {
            browsed: Some(result(BrowseStrategy::Full, vec![browsed_node.clone()])),
            cached: Some(result(BrowseStrategy::Cached, vec![browsed_node, cached_node.clone()])),
        };
        assert_eq!(both.dump_set(), Some(vec![cached_node.clone()]));
        assert_eq!(both.into_nodes().map(|n| n.len()), Some(2));

        assert_eq!(Walked::default().dump_set(), None);
        assert!(Walked::default().into_nodes().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_is_connection_error() {
        let server = SimulatedServer::new();
        server.set_unreachable("opc.tcp://sim:4840", true);
        let config = config(Duration::from_secs(1)).build().unwrap();

        let err = run_with(server, config, Arc::new(MemorySink::new()), QuitSignal::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
