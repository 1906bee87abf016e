//! Shutdown coordination.
//!
//! `Shutdown` is the server-wide trigger; `ShutdownCoordinator` drains the
//! connection registry once it fires.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;

use crate::net::connection::{AbortReason, Connection};
use crate::net::registry::ConnectionRegistry;
use crate::observability::metrics;

/// Server-wide shutdown trigger.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown trigger.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of the two-phase drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed within the graceful deadline.
    Clean,
    /// Stragglers had to be aborted, and all of them finished.
    Forced,
    /// Even the abort phase timed out.
    Incomplete,
}

impl DrainOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainOutcome::Clean => "clean",
            DrainOutcome::Forced => "forced",
            DrainOutcome::Incomplete => "incomplete",
        }
    }
}

/// Walks the registry to close, then abort, every live connection.
///
/// A timeout means "escalate", not "released": a connection still running
/// when the deadline hits is left as it is.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    registry: ConnectionRegistry,
}

impl ShutdownCoordinator {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Ask every connection to close gracefully and wait up to `timeout` for
    /// all of them to reach a terminal state.
    pub async fn walk_and_close(&self, timeout: Duration) -> bool {
        self.walk(timeout, |connection| {
            connection.close_gracefully();
        })
        .await
    }

    /// Abort every connection and wait up to `timeout` for their teardown.
    pub async fn walk_and_abort(&self, timeout: Duration) -> bool {
        self.walk(timeout, |connection| {
            connection.abort(AbortReason::Shutdown);
        })
        .await
    }

    /// Graceful close within `close_timeout`, then abort within
    /// `abort_timeout` if anything is left.
    pub async fn drain(&self, close_timeout: Duration, abort_timeout: Duration) -> DrainOutcome {
        tracing::info!(
            connections = self.registry.len(),
            timeout_secs = close_timeout.as_secs_f64(),
            "Draining connections"
        );

        let outcome = if self.walk_and_close(close_timeout).await {
            DrainOutcome::Clean
        } else {
            tracing::warn!(
                remaining = self.registry.len(),
                timeout_secs = abort_timeout.as_secs_f64(),
                "Graceful drain timed out, aborting remaining connections"
            );
            if self.walk_and_abort(abort_timeout).await {
                DrainOutcome::Forced
            } else {
                DrainOutcome::Incomplete
            }
        };

        metrics::record_drain(outcome.as_str());
        if outcome == DrainOutcome::Incomplete {
            tracing::error!(remaining = self.registry.len(), "Drain incomplete");
        } else {
            tracing::info!(outcome = outcome.as_str(), "Drain complete");
        }
        outcome
    }

    async fn walk<F>(&self, timeout: Duration, action: F) -> bool
    where
        F: Fn(&Connection),
    {
        let snapshot: Vec<Arc<Connection>> = self.registry.snapshot();
        // Subscribe before acting so no completion is missed.
        let closed: Vec<_> = snapshot.iter().map(|c| c.closed()).collect();
        for connection in &snapshot {
            action(connection.as_ref());
        }
        drop(snapshot);

        tokio::time::timeout(timeout, join_all(closed)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::test_support::open_connection;
    use crate::net::connection::{CloseOutcome, ConnectionState};

    /// Closes as soon as it is asked to.
    fn cooperate(connection: &Arc<Connection>) {
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            connection.closing().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            connection.mark_closed();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn cooperating_connections_drain_cleanly() {
        let registry = ConnectionRegistry::new();
        let connections: Vec<_> = (0..5).map(|_| open_connection(&registry)).collect();
        for (connection, _) in &connections {
            cooperate(connection);
        }

        let coordinator = ShutdownCoordinator::new(registry.clone());
        assert!(coordinator.walk_and_close(Duration::from_secs(5)).await);
        for (connection, _) in &connections {
            assert_eq!(connection.state(), ConnectionState::Closed);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_connection_times_out_then_is_aborted() {
        let registry = ConnectionRegistry::new();
        let (polite, _p) = open_connection(&registry);
        let (stubborn, _s) = open_connection(&registry);
        cooperate(&polite);

        let coordinator = ShutdownCoordinator::new(registry.clone());
        let started = tokio::time::Instant::now();
        assert!(!coordinator.walk_and_close(Duration::from_secs(5)).await);
        assert!(started.elapsed() >= Duration::from_secs(5));

        assert_eq!(polite.state(), ConnectionState::Closed);
        assert_eq!(stubborn.state(), ConnectionState::ClosingGracefully);
        assert!(registry.contains(stubborn.id()));

        assert!(coordinator.walk_and_abort(Duration::from_secs(2)).await);
        assert_eq!(
            stubborn.outcome(),
            Some(CloseOutcome::Aborted(AbortReason::Shutdown))
        );
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_each_outcome() {
        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::new(registry.clone());
        assert_eq!(
            coordinator
                .drain(Duration::from_secs(5), Duration::from_secs(2))
                .await,
            DrainOutcome::Clean
        );

        let (_stubborn, _s) = open_connection(&registry);
        assert_eq!(
            coordinator
                .drain(Duration::from_secs(5), Duration::from_secs(2))
                .await,
            DrainOutcome::Forced
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 2);

        shutdown.trigger();
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
