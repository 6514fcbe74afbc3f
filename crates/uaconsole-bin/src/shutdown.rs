// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Graceful shutdown coordination.
//!
//! OS signals (SIGTERM, SIGINT, SIGQUIT on Unix, Ctrl+C elsewhere) raise the
//! session's [`QuitSignal`]. The monitoring loop notices the flag on its next
//! tick and the client disconnects cleanly.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use uaconsole_session::QuitSignal;

use crate::error::{BinError, BinResult};

// =============================================================================
// ShutdownCoordinator
// =============================================================================

/// Turns OS signals into a raised [`QuitSignal`].
///
/// # Example
///
/// ```ignore
/// use uaconsole_bin::shutdown::ShutdownCoordinator;
///
/// let coordinator = ShutdownCoordinator::new();
/// let _listener = coordinator.clone().listen();
///
/// controller.monitor(&coordinator.quit_signal()).await?;
/// ```
#[derive(Clone)]
pub struct ShutdownCoordinator {
    quit: QuitSignal,
    sender: Arc<broadcast::Sender<()>>,
}

impl ShutdownCoordinator {
    /// Creates a new shutdown coordinator.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            quit: QuitSignal::new(),
            sender: Arc::new(sender),
        }
    }

    /// The flag raised on shutdown.
    pub fn quit_signal(&self) -> QuitSignal {
        self.quit.clone()
    }

    /// Subscribes to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Initiates shutdown. Idempotent.
    pub fn initiate_shutdown(&self) {
        if !self.quit.is_raised() {
            info!("Shutdown initiated");
            self.quit.raise();
            let _ = self.sender.send(());
        }
    }

    /// Returns true if shutdown has been initiated.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.quit.is_raised()
    }

    /// Waits for an OS signal, then initiates shutdown.
    ///
    /// # Errors
    ///
    /// Fails if a signal handler cannot be registered.
    pub async fn wait_for_shutdown(&self) -> BinResult<()> {
        if self.is_shutdown_initiated() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let register = |kind: SignalKind, name: &str| {
                signal(kind).map_err(|e| BinError::runtime(format!("failed to register {name} handler: {e}")))
            };
            let mut sigterm = register(SignalKind::terminate(), "SIGTERM")?;
            let mut sigint = register(SignalKind::interrupt(), "SIGINT")?;
            let mut sigquit = register(SignalKind::quit(), "SIGQUIT")?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigquit.recv() => info!("Received SIGQUIT"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| BinError::runtime(format!("failed to register Ctrl+C handler: {e}")))?;
            info!("Received Ctrl+C");
        }

        self.initiate_shutdown();
        Ok(())
    }

    /// Spawns a task waiting for OS signals.
    pub fn listen(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.wait_for_shutdown().await {
                warn!(error = %e, "Signal handling unavailable, Ctrl+C will not stop the client cleanly");
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_raises_quit_signal() {
        let coordinator = ShutdownCoordinator::new();
        let quit = coordinator.quit_signal();
        let mut rx = coordinator.subscribe();

        assert!(!quit.is_raised());
        coordinator.initiate_shutdown();

        assert!(quit.is_raised());
        assert!(coordinator.is_shutdown_initiated());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        coordinator.initiate_shutdown();
        coordinator.initiate_shutdown();

        assert!(rx.recv().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_when_already_initiated() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.initiate_shutdown();
        assert!(coordinator.wait_for_shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let coordinator = ShutdownCoordinator::new();
        let clone = coordinator.clone();
        clone.initiate_shutdown();
        assert!(coordinator.quit_signal().is_raised());
    }
}
