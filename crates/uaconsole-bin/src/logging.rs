// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Logging and tracing initialization.
//!
//! Diagnostics go to stderr so that stdout carries only the client's own
//! output. With a log directory, every event is also appended to a
//! `ConsoleLog_<timestamp>.txt` file without ANSI colors.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use uaconsole_session::output::unique_log_path;

use crate::cli::LogFormat;
use crate::error::{BinError, BinResult};

/// Prefix of diagnostic log files.
pub const LOG_FILE_PREFIX: &str = "ConsoleLog";

// =============================================================================
// Logging Initialization
// =============================================================================

/// Initializes the logging subsystem.
///
/// # Arguments
///
/// * `level` - Log level string (trace, debug, info, warn, error)
/// * `format` - Log output format (text, json, compact)
/// * `log_dir` - Optional directory receiving a copy of every event
///
/// Returns the path of the log file, if one was created.
///
/// # Example
///
/// ```ignore
/// use uaconsole_bin::cli::LogFormat;
/// use uaconsole_bin::logging::init_logging;
///
/// init_logging("info", LogFormat::Text, None)?;
/// ```
pub fn init_logging(level: &str, format: LogFormat, log_dir: Option<&Path>) -> BinResult<Option<PathBuf>> {
    let env_filter = build_filter(level)?;

    let (file, path) = match log_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            (Some(file), Some(path))
        }
        None => (None, None),
    };

    match format {
        LogFormat::Text => init_text_logging(env_filter, file)?,
        LogFormat::Json => init_json_logging(env_filter, file)?,
        LogFormat::Compact => init_compact_logging(env_filter, file)?,
    }

    Ok(path)
}

/// Builds the filter from `RUST_LOG`, falling back to `level`.
pub fn build_filter(level: &str) -> BinResult<EnvFilter> {
    let directive = |d: &str| {
        d.parse()
            .map_err(|e| BinError::config(format!("invalid log directive '{d}': {e}")))
    };

    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive(directive("opcua=warn")?)
        .add_directive(directive("tokio=info")?))
}

fn open_log_file(dir: &Path) -> BinResult<(File, PathBuf)> {
    std::fs::create_dir_all(dir).map_err(|e| BinError::io(format!("{}: {e}", dir.display())))?;
    let path = unique_log_path(dir, LOG_FILE_PREFIX, "txt");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BinError::io(format!("{}: {e}", path.display())))?;
    Ok((file, path))
}

fn init_error(e: impl std::fmt::Display) -> BinError {
    BinError::runtime(format!("logging already initialized: {e}"))
}

/// Initializes text-based logging (default).
fn init_text_logging(filter: EnvFilter, file: Option<File>) -> BinResult<()> {
    let is_terminal = std::io::IsTerminal::is_terminal(&std::io::stderr());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(is_terminal),
        )
        .with(file.map(|f| fmt::layer().with_writer(Mutex::new(f)).with_ansi(false)))
        .try_init()
        .map_err(init_error)
}

/// Initializes JSON logging (for log aggregation).
fn init_json_logging(filter: EnvFilter, file: Option<File>) -> BinResult<()> {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(file.map(|f| fmt::layer().json().with_writer(Mutex::new(f))))
        .try_init()
        .map_err(init_error)
}

/// Initializes compact logging (minimal output).
fn init_compact_logging(filter: EnvFilter, file: Option<File>) -> BinResult<()> {
    let is_terminal = std::io::IsTerminal::is_terminal(&std::io::stderr());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_ansi(is_terminal),
        )
        .with(file.map(|f| fmt::layer().compact().with_writer(Mutex::new(f)).with_ansi(false)))
        .try_init()
        .map_err(init_error)
}

// =============================================================================
// Log Level Parsing
// =============================================================================

/// Parses a log level string into a `Level`.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("Info"), Level::INFO);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_build_filter() {
        assert!(build_filter("debug").is_ok());
    }

    #[test]
    fn test_log_file_is_created_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_file, path) = open_log_file(&dir.path().join("logs")).unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(LOG_FILE_PREFIX));
        assert!(name.ends_with(".txt"));
    }
}
