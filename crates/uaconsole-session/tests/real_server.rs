// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Tests against a live OPC UA server.
//!
//! These tests require the `real-transport` feature and a running server,
//! for example the OPC Foundation reference server.
//!
//! # Environment Variables
//!
//! - `UACONSOLE_TEST_ENDPOINT`: server endpoint
//!   (default: opc.tcp://localhost:62541/Quickstarts/ReferenceServer)
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p uaconsole-session --features real-transport --test real_server -- --ignored
//! ```

#![cfg(feature = "real-transport")]

use std::sync::Arc;
use std::time::Duration;

use uaconsole_session::config::DEFAULT_ENDPOINT;
use uaconsole_session::session::OpcUaFacade;
use uaconsole_session::{
    BrowseStrategy, ClientConfig, MemorySink, NodeId, QuitSignal, SessionLifecycleController, SessionState,
    TerminationReason,
};

fn test_endpoint() -> String {
    std::env::var("UACONSOLE_TEST_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
}

fn controller() -> SessionLifecycleController<OpcUaFacade> {
    let config = ClientConfig::builder()
        .endpoint(test_endpoint())
        .use_security(false)
        .deadline(Some(Duration::from_secs(5)))
        .build()
        .unwrap();
    let pki = tempfile::tempdir().unwrap().into_path();
    SessionLifecycleController::new(OpcUaFacade::new(pki), config, Arc::new(MemorySink::new()))
}

#[tokio::test]
#[ignore = "requires a running OPC UA server"]
async fn test_real_server_connect_and_disconnect() {
    let controller = controller();
    controller.connect(controller.config().endpoint.clone()).await.unwrap();
    assert_eq!(controller.state(), SessionState::Connected);

    controller.disconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test]
#[ignore = "requires a running OPC UA server"]
async fn test_real_server_browse_and_read() {
    let controller = controller();
    controller.connect(controller.config().endpoint.clone()).await.unwrap();

    let walk = controller
        .browse(&NodeId::OBJECTS_FOLDER, BrowseStrategy::Managed { batch_size: 16 })
        .await
        .unwrap();
    assert!(!walk.nodes.is_empty());

    let variables: Vec<_> = walk.nodes.iter().filter(|n| n.is_variable()).take(20).cloned().collect();
    let outcomes = controller.read_values(&variables).await;
    assert_eq!(outcomes.len(), variables.len());

    controller.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running OPC UA server"]
async fn test_real_server_monitor_deadline() {
    let controller = controller();
    controller.connect(controller.config().endpoint.clone()).await.unwrap();

    let reason = controller.monitor(&QuitSignal::new()).await.unwrap();
    assert_eq!(reason, TerminationReason::DeadlineExceeded);
    controller.disconnect().await.unwrap();
}
