//! Process-wide engine state: configuration, the transport handle, task
//! accounting, and the portal registry.

use crate::portal::HostPortal;
use crate::transport::{TcpTransport, Transport};
use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Tuning knobs shared by every portal of a context.
///
/// Plain fields with stock defaults; override with struct update syntax.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Workload units a single connection carries before its sender blocks.
    pub max_workload: u64,
    /// Hard cap on simultaneous connections per portal.
    pub max_connections: usize,
    /// A connection with an empty pipeline for this long retires itself.
    pub min_idle: Duration,
    /// Cap on the pause a retrying operation can impose on its portal.
    pub max_wait: Duration,
    /// How often a connection's receiver re-evaluates the pool size.
    pub check_connection_interval: Duration,
    /// Deadline handed to the transport for each dial.
    pub connect_timeout: Duration,
    /// Consecutive failed dials after which queued work is failed outright.
    pub abort_conn_attempts: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_workload: 16,
            max_connections: 4,
            min_idle: Duration::from_secs(30),
            max_wait: Duration::from_secs(60),
            check_connection_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            abort_conn_attempts: 4,
        }
    }
}

/// Counts every worker task the engine spawns, so a process shutdown can
/// wait for all of them to drain.
#[derive(Debug, Default)]
pub(crate) struct TaskCounter {
    running: AtomicUsize,
    drained: Notify,
}

impl TaskCounter {
    pub(crate) fn started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finished(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    async fn wait_drained(&self) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Shared engine state for one process.
///
/// A context owns the transport, the tuning knobs, and a registry of portals
/// keyed by endpoint, so every caller talking to the same `host:port` shares
/// one queue and one pool. Contexts are handled as `Arc<PortalContext>`;
/// cloning the `Arc` is the only sharing mechanism.
pub struct PortalContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ContextConfig,
    pub(crate) tasks: TaskCounter,
    portals: Mutex<HashMap<String, HostPortal>>,
}

impl PortalContext {
    /// Build a context over an explicit transport.
    pub fn new(transport: Arc<dyn Transport>, config: ContextConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            tasks: TaskCounter::default(),
            portals: Mutex::new(HashMap::new()),
        })
    }

    /// Build a context over the stock TCP transport.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(Arc::new(TcpTransport), ContextConfig::default())
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Get or create the portal for `host:port`.
    pub fn portal(self: &Arc<Self>, host: &str, port: u16) -> HostPortal {
        let mut portals = self.portals.lock().unwrap();
        portals
            .entry(format!("{host}:{port}"))
            .or_insert_with(|| {
                debug!(host, port, "creating portal");
                HostPortal::new(self.clone(), host, port)
            })
            .clone()
    }

    /// Shut every registered portal down and forget it.
    pub async fn shutdown_all(&self, quick: bool) {
        let portals: Vec<HostPortal> = {
            let mut registry = self.portals.lock().unwrap();
            registry.drain().map(|(_, p)| p).collect()
        };
        for portal in portals {
            portal.shutdown(quick).await;
        }
    }

    /// Worker tasks currently alive across all portals.
    pub fn running_tasks(&self) -> usize {
        self.tasks.count()
    }

    /// Wait until every worker task the engine spawned has exited.
    pub async fn wait_idle(&self) {
        self.tasks.wait_drained().await;
    }
}

impl std::fmt::Debug for PortalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalContext")
            .field("config", &self.config)
            .field("running_tasks", &self.running_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_shares_portals() {
        let ctx = PortalContext::with_defaults();
        let a = ctx.portal("localhost", 7001);
        let b = ctx.portal("localhost", 7001);
        let c = ctx.portal("localhost", 7002);
        assert!(a.same_portal(&b));
        assert!(!a.same_portal(&c));
    }

    #[tokio::test]
    async fn test_task_counter_drains() {
        let counter = Arc::new(TaskCounter::default());
        counter.started();
        counter.started();

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_drained().await })
        };
        tokio::task::yield_now().await;

        counter.finished();
        counter.finished();
        waiter.await.unwrap();
        assert_eq!(counter.count(), 0);
    }
}
