// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the uaconsole binary.

use thiserror::Error;
use uaconsole_session::SessionError;

/// Result type alias for uaconsole-bin operations.
pub type BinResult<T> = Result<T, BinError>;

/// Errors that can occur in the uaconsole binary.
#[derive(Debug, Error)]
pub enum BinError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The initial connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session failed and could not be recovered.
    #[error("Session failed: {0}")]
    Fatal(String),

    /// Runtime error.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Session layer error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        /// The context description.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<BinError>,
    },
}

impl BinError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a fatal session error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Creates a runtime error.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Creates an I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Adds context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the process exit code for this error.
    ///
    /// 1 generic, 2 configuration, 3 connection or timeout, 4 fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::Connection(_) => 3,
            Self::Fatal(_) => 4,
            Self::Runtime(_) | Self::Io(_) => 1,
            Self::Session(err) => match err {
                SessionError::Configuration(_) => 2,
                SessionError::Connection(_) | SessionError::Timeout(_) => 3,
                SessionError::Fatal(_) => 4,
                _ => 1,
            },
            Self::WithContext { source, .. } => source.exit_code(),
        }
    }
}

impl From<std::io::Error> for BinError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// =============================================================================
// Error Reporting
// =============================================================================

/// Reports an error with appropriate formatting.
pub fn report_error(error: &BinError) {
    eprintln!("Error: {}", error);

    if let BinError::Session(session) = error {
        for hint in session.recovery_hints() {
            eprintln!("  Hint: {}", hint);
        }
    }

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("  Caused by: {}", cause);
        source = cause.source();
    }
}

/// Reports an error and exits with the appropriate code.
pub fn report_error_and_exit(error: BinError) -> ! {
    report_error(&error);
    std::process::exit(error.exit_code())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uaconsole_session::{ConnectionError, FatalError};

    #[test]
    fn test_error_creation() {
        let err = BinError::config("bad url");
        assert_eq!(err.to_string(), "Configuration error: bad url");
    }

    #[test]
    fn test_error_with_context() {
        let err = BinError::connection("refused").with_context("initial connect");
        assert_eq!(err.to_string(), "initial connect: Connection error: refused");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BinError::runtime("x").exit_code(), 1);
        assert_eq!(BinError::io("x").exit_code(), 1);
        assert_eq!(BinError::config("x").exit_code(), 2);
        assert_eq!(BinError::connection("x").exit_code(), 3);
        assert_eq!(BinError::fatal("x").exit_code(), 4);
    }

    #[test]
    fn test_session_error_exit_codes() {
        let refused: BinError = SessionError::from(ConnectionError::refused("opc.tcp://x:4840")).into();
        assert_eq!(refused.exit_code(), 3);

        let fatal: BinError = SessionError::from(FatalError::retries_exhausted(3, "refused")).into();
        assert_eq!(fatal.exit_code(), 4);
        assert!(fatal.to_string().contains("3"));
    }
}
