//! `AgentContext` (§9 design note): one value constructed at startup and
//! passed to every subsystem instead of the source's globally-addressable
//! configuration/logger/registry/channel/EventLoop singletons.
//!
//! Plays the role the teacher's own `Agent` struct in `main.rs` plays for
//! its single task family, generalized to the four families plus the
//! shared shutdown signal every component selects on.

use crate::channel::ChannelManager;
use crate::registry::TaskRegistry;
use crate::resource_monitor::ResourceMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct AgentContext {
    pub registry: Arc<TaskRegistry>,
    pub channel: Arc<ChannelManager>,
    pub resource_monitor: Arc<ResourceMonitor>,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentContext {
    pub fn new(top_n: usize, sink_queue_capacity: usize, sink_error_suppress: Duration) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            registry: Arc::new(TaskRegistry::empty()),
            channel: Arc::new(ChannelManager::new(sink_queue_capacity, sink_error_suppress)),
            resource_monitor: Arc::new(ResourceMonitor::new(top_n)),
            shutdown_tx,
        }
    }

    /// A fresh receiver for one component's `select!` loop. Every
    /// component gets its own handle; none of them observe each other.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcasts shutdown to every subscribed component (§5, I8).
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_observed_by_every_subscriber() {
        let ctx = AgentContext::new(5, 10, Duration::from_secs(60));
        let rx_a = ctx.shutdown_rx();
        let rx_b = ctx.shutdown_rx();
        ctx.request_shutdown();
        assert!(*rx_a.borrow());
        assert!(*rx_b.borrow());
    }
}
