// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA client session orchestration.
//!
//! This crate keeps one logical client session alive against an OPC UA
//! server: it connects, walks the address space, subscribes to a sample of
//! variables, and survives channel loss through reconnects or durable
//! subscription transfer. The protocol stack itself sits behind the
//! [`SessionFacade`] trait.
//!
//! # Components
//!
//! ```text
//! SessionLifecycleController
//! ├── StateMachine         - single source of truth for the session state
//! ├── SubscriptionManager  - subscriptions, transfer, notification streams
//! ├── AddressSpaceWalker   - full, managed and cached discovery
//! └── OneShot              - Read / Write / Call
//!            │
//!            ▼
//!      SharedFacade<F: SessionFacade>   (per-channel request gate)
//!            │
//!      SimulatedServer | OpcUaFacade (feature `real-transport`)
//! ```
//!
//! # Error Handling
//!
//! ```text
//! SessionError
//! ├── Connection    - handshake, transport, keep-alive
//! ├── Timeout       - connect and request deadlines
//! ├── Transfer      - durable subscription transfer refused
//! ├── Capacity      - server limits exceeded
//! ├── Fatal         - the session cannot continue
//! ├── Browse        - address-space traversal
//! ├── Subscription  - subscription misuse
//! ├── Operation     - service faults
//! └── Configuration - invalid settings
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use uaconsole_session::{ClientConfig, ConsoleSink, QuitSignal, SessionLifecycleController, SimulatedServer};
//!
//! let config = ClientConfig::builder().endpoint("opc.tcp://localhost:4840").build()?;
//! let controller = SessionLifecycleController::new(SimulatedServer::new(), config.clone(), Arc::new(ConsoleSink::new()));
//!
//! controller.connect(config.endpoint.clone()).await?;
//! let reason = controller.monitor(&QuitSignal::new()).await?;
//! controller.disconnect().await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod output;
pub mod session;
pub mod sim;
pub mod types;
pub mod walker;

pub use config::{
    BrowsePlan, ClientConfig, ClientConfigBuilder, DurableSchedule, MonitorSettings, ReconnectPolicy,
    SubscriptionDefaults,
};
pub use error::{
    BrowseError, CapacityError, ConfigurationError, ConnectionError, ErrorCode, ErrorSeverity, FatalError,
    OperationError, SessionError, SessionResult, SubscriptionError, TimeoutError, TransferError,
};
pub use output::{ConsoleSink, FileSink, MemorySink, OutputSink, TeeSink};
pub use session::{
    ChannelHandle, QuitSignal, SessionFacade, SessionLifecycleController, SessionState, SharedFacade,
    SubscriptionManager, SubscriptionSpec, TerminationReason,
};
pub use sim::SimulatedServer;
pub use types::{DataValue, EndpointTarget, NodeClass, NodeId, NodeRef, SecurityMode, StatusCode, UaValue};
pub use walker::{canonical, filter_variables, AddressSpaceWalker, BrowseStrategy, VariableFilter, WalkResult};
