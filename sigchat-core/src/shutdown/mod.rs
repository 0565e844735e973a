//! Graceful shutdown coordinator
//!
//! Long-running tasks (the listener, each connection loop, the client
//! reconnect loop) subscribe to the coordinator and hold a [`TaskGuard`]
//! while they run. `shutdown()` broadcasts the signal and then waits for all
//! guards to drop, bounded by the configured timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

#[derive(Debug, Default)]
struct ActiveTasks {
    count: AtomicUsize,
    drained: Notify,
}

/// Held by a running task; dropping it marks the task finished
#[derive(Debug)]
pub struct TaskGuard {
    tasks: Arc<ActiveTasks>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.tasks.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tasks.drained.notify_waiters();
        }
    }
}

/// Graceful shutdown coordinator
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    tasks: Arc<ActiveTasks>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(ShutdownState::Running),
            shutdown_tx,
            tasks: Arc::new(ActiveTasks::default()),
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Register a running task
    pub fn track(&self) -> TaskGuard {
        self.tasks.count.fetch_add(1, Ordering::AcqRel);
        TaskGuard { tasks: self.tasks.clone() }
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.count.load(Ordering::Acquire)
    }

    /// Broadcast a graceful shutdown and wait for tracked tasks to finish
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!(active = self.active_tasks(), "Initiating graceful shutdown");

        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            // No subscribers: nothing to drain.
            info!("No tasks subscribed to shutdown");
        }

        if !self.drain().await {
            warn!(remaining = self.active_tasks(), "Shutdown timed out with tasks still running");
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    /// Wait for every tracked task to finish, bounded by the timeout.
    /// Returns false if tasks were still running when it expired.
    pub async fn drain(&self) -> bool {
        tokio::time::timeout(self.timeout, async {
            loop {
                let notified = self.tasks.drained.notified();
                if self.active_tasks() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Broadcast an immediate shutdown without waiting
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");
        *self.state.write().await = ShutdownState::Shutdown;
        if let Err(e) = self.shutdown_tx.send(ShutdownSignal::Immediate) {
            error!("Failed to send immediate shutdown signal: {}", e);
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Resolve once a shutdown signal arrives, or immediately if one already did
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down().await {
            return;
        }
        let _ = rx.recv().await;
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown().await;
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Received Ctrl+C");
        coordinator.shutdown().await;
    });
}
