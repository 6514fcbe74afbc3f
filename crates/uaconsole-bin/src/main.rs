// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! uaconsole - console OPC UA reference client
//!
//! Main binary entry point.

use uaconsole_bin::error::{report_error_and_exit, BinResult};
use uaconsole_bin::{init_logging, workflow, Cli, ShutdownCoordinator};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = run(cli).await {
        report_error_and_exit(e);
    }
}

async fn run(cli: Cli) -> BinResult<()> {
    let log_file = init_logging(cli.effective_log_level(), cli.log_format, cli.log_dir.as_deref())?;
    if let Some(path) = &log_file {
        tracing::info!(path = %path.display(), "Writing diagnostics to file");
    }
    tracing::info!(version = uaconsole_bin::VERSION, endpoint = %cli.url, "Starting uaconsole");

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.clone().listen();

    let result = workflow::run(&cli, shutdown.quit_signal()).await;
    listener.abort();
    result
}
