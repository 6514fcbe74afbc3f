// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # uaconsole-bin
//!
//! Console OPC UA reference client built on `uaconsole-session`.
//!
//! - CLI argument parsing with clap
//! - Logging initialization
//! - Graceful shutdown on OS signals
//! - The client workflow: samples, walks, subscription and monitoring
//!
//! ## Architecture
//!
//! ```text
//!            main.rs
//!               │
//!        ┌──────┼──────────┐
//!        ▼      ▼          ▼
//!      cli   logging    shutdown
//!        │                 │ QuitSignal
//!        └──────► workflow ◄┘
//!                    │
//!        SessionLifecycleController (uaconsole-session)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Connect to the default reference server endpoint
//! uaconsole
//!
//! # Subscribe to a sample of variables for ten seconds
//! uaconsole opc.tcp://plc:4840 --no-security --subscribe -t 10000
//!
//! # Durable subscription transfer against the simulated server
//! uaconsole --simulate --durable
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod cli;
pub mod error;
pub mod logging;
pub mod shutdown;
pub mod workflow;

// =============================================================================
// Re-exports
// =============================================================================

pub use cli::{Cli, LogFormat};
pub use error::{BinError, BinResult};
pub use logging::init_logging;
pub use shutdown::ShutdownCoordinator;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
