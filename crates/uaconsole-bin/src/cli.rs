// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! CLI argument parsing.
//!
//! `uaconsole [OPTIONS] [URL]` connects to one server, optionally walks its
//! address space, optionally subscribes to a sample of its variables and
//! keeps the session alive until Ctrl-C or the deadline.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use uaconsole_session::config::{BrowsePlan, SubscriptionDefaults, DEFAULT_ENDPOINT};
use uaconsole_session::{ClientConfig, SessionResult};

// =============================================================================
// Main CLI Structure
// =============================================================================

/// Console OPC UA reference client
///
/// Connects to an OPC UA server, browses it, subscribes to a sample of its
/// variables and survives reconnects and durable subscription transfers.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "uaconsole",
    author = "Sylvex <contact@sylvex.io>",
    version,
    about = "Console OPC UA reference client",
    long_about = None
)]
pub struct Cli {
    /// Server endpoint URL
    #[arg(default_value = DEFAULT_ENDPOINT, env = "UACONSOLE_ENDPOINT")]
    pub url: String,

    /// Connect without message security
    #[arg(long)]
    pub no_security: bool,

    /// Monitoring deadline in milliseconds (0 = default deadline)
    #[arg(short, long, default_value = "0")]
    pub timeout: u64,

    /// Subscribe to a sample of the server's variables
    #[arg(short, long)]
    pub subscribe: bool,

    /// Close and transfer the subscription during monitoring
    #[arg(long)]
    pub durable: bool,

    /// Walk the address space with one browse per node
    #[arg(long)]
    pub browse_all: bool,

    /// Walk the address space with batched browses
    #[arg(long)]
    pub managed_browse_all: bool,

    /// Load the address space from the node cache
    #[arg(long)]
    pub fetch_all: bool,

    /// Read every discovered variable and print it as JSON
    #[arg(long)]
    pub json_values: bool,

    /// Maximum number of variables to subscribe to
    #[arg(long, default_value = "1000")]
    pub max_variables: usize,

    /// Seed of the variable sampling
    #[arg(long, default_value = "62541")]
    pub seed: u64,

    /// Print every notification
    #[arg(short, long)]
    pub verbose: bool,

    /// Run against the built-in simulated server
    #[arg(long)]
    pub simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "UACONSOLE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json, compact)
    #[arg(long, default_value = "text", env = "UACONSOLE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Also write diagnostics to a ConsoleLog_<timestamp>.txt file in this directory
    #[arg(long, env = "UACONSOLE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Enable quiet mode (no console output)
    #[arg(short, long)]
    pub quiet: bool,
}

// =============================================================================
// Enums
// =============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
    /// Compact format for minimal output
    Compact,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl Cli {
    /// Parse CLI arguments from the command line.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the effective log level based on flags.
    pub fn effective_log_level(&self) -> &str {
        if self.quiet {
            "warn"
        } else {
            &self.log_level
        }
    }

    /// Monitoring deadline; `None` keeps the configured default.
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    /// Builds the client configuration.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` for an invalid URL or sampling setting.
    pub fn to_config(&self) -> SessionResult<ClientConfig> {
        let browse = BrowsePlan {
            full_browse: self.browse_all,
            managed_browse: self.managed_browse_all,
            fetch_all: self.fetch_all,
            json_values: self.json_values,
            ..BrowsePlan::default()
        };
        let subscription = SubscriptionDefaults {
            max_variables: self.max_variables,
            seed: self.seed,
            ..SubscriptionDefaults::default()
        };

        let mut builder = ClientConfig::builder()
            .endpoint(&self.url)
            .use_security(!self.no_security)
            .durable_subscriptions(self.durable)
            .browse(browse)
            .subscription(subscription)
            .subscribe(self.subscribe || self.durable)
            .verbose(self.verbose);
        if let Some(deadline) = self.deadline() {
            builder = builder.deadline(Some(deadline));
        }
        builder.build()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uaconsole_session::config::MonitorSettings;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["uaconsole"]);
        assert_eq!(cli.url, DEFAULT_ENDPOINT);
        assert!(!cli.no_security);
        assert_eq!(cli.timeout, 0);

        let config = cli.to_config().unwrap();
        assert!(config.endpoint.uses_security());
        assert_eq!(config.monitor.deadline, Some(MonitorSettings::DEFAULT_DEADLINE));
        assert!(!config.subscribe);
        assert!(!config.browse.any());
    }

    #[test]
    fn test_positional_url() {
        let cli = Cli::parse_from(["uaconsole", "opc.tcp://plc:4840", "--no-security"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.endpoint.url(), "opc.tcp://plc:4840");
        assert!(!config.endpoint.uses_security());
    }

    #[test]
    fn test_timeout_overrides_deadline() {
        let cli = Cli::parse_from(["uaconsole", "-t", "2500"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.monitor.deadline, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_durable_implies_subscribe() {
        let cli = Cli::parse_from(["uaconsole", "--durable"]);
        let config = cli.to_config().unwrap();
        assert!(config.subscribe);
        assert!(config.monitor.is_durable());
        assert_eq!(config.monitor.deadline, Some(MonitorSettings::DURABLE_DEADLINE));
    }

    #[test]
    fn test_browse_flags() {
        let cli = Cli::parse_from([
            "uaconsole",
            "--browse-all",
            "--managed-browse-all",
            "--json-values",
            "--max-variables",
            "50",
            "--seed",
            "7",
        ]);
        let config = cli.to_config().unwrap();
        assert!(config.browse.full_browse);
        assert!(config.browse.managed_browse);
        assert!(!config.browse.fetch_all);
        assert!(config.browse.json_values);
        assert_eq!(config.subscription.max_variables, 50);
        assert_eq!(config.subscription.seed, 7);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let cli = Cli::parse_from(["uaconsole", "http://nope"]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_quiet_mode() {
        let cli = Cli::parse_from(["uaconsole", "-q"]);
        assert!(cli.quiet);
        assert_eq!(cli.effective_log_level(), "warn");
    }

    #[test]
    fn test_log_format() {
        let cli = Cli::parse_from(["uaconsole", "--log-format", "json"]);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
