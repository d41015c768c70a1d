// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Graceful shutdown coordination.
//!
//! OS signals (SIGTERM, SIGINT) or a manual request cancel one shared
//! [`CancellationToken`]; every long-running task watches a child of it.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// ShutdownCoordinator
// =============================================================================

/// Coordinates graceful shutdown.
///
/// ```ignore
/// let coordinator = ShutdownCoordinator::new();
/// let token = coordinator.token();
///
/// tokio::spawn(async move { adapter.run(token).await });
/// coordinator.wait_for_shutdown().await;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Creates a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Initiates shutdown. Repeated calls are ignored.
    pub fn initiate_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown initiated");
            self.token.cancel();
        }
    }

    /// Returns true if shutdown has been initiated.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for an OS signal or a manual request, then initiates shutdown.
    pub async fn wait_for_shutdown(&self) {
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = os_signal() => {}
        }
        self.initiate_shutdown();
    }
}

#[cfg(unix)]
async fn os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to register signal handlers, falling back to Ctrl+C");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn os_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// ShutdownGuard
// =============================================================================

/// A guard that triggers shutdown when dropped.
///
/// Held by tasks whose unexpected end must stop the process.
pub struct ShutdownGuard {
    coordinator: ShutdownCoordinator,
    trigger_on_drop: bool,
}

impl ShutdownGuard {
    /// Creates a new shutdown guard.
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self {
            coordinator,
            trigger_on_drop: true,
        }
    }

    /// Disarms the guard so it won't trigger shutdown on drop.
    pub fn disarm(mut self) {
        self.trigger_on_drop = false;
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.trigger_on_drop && !self.coordinator.is_shutdown_initiated() {
            warn!("ShutdownGuard dropped, initiating shutdown");
            self.coordinator.initiate_shutdown();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
