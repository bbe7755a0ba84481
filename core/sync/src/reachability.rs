//! Connectivity tracking.
//!
//! The monitor is advisory: the worker uses it to hold work while offline
//! and to wake every lane when connectivity returns, but a wrong reading can
//! only delay sends, never lose them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Believed network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Something that can tell whether the remote is reachable.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Publishes connectivity transitions to subscribers.
#[derive(Clone)]
pub struct ReachabilityMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ReachabilityMonitor {
    /// Create a monitor that starts out online.
    pub fn new() -> Self {
        Self::with_initial(Connectivity::Online)
    }

    pub fn with_initial(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Record the current connectivity. Returns whether it changed.
    pub fn set(&self, connectivity: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
        if changed {
            info!("Connectivity changed to {:?}", connectivity);
        }
        changed
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Poll `probe` every `period` and publish what it reports.
    ///
    /// The task runs until aborted.
    pub fn spawn_polling<P>(&self, probe: Arc<P>, period: Duration) -> JoinHandle<()>
    where
        P: ReachabilityProbe + ?Sized + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let connectivity = if probe.is_reachable().await {
                    Connectivity::Online
                } else {
                    Connectivity::Offline
                };
                monitor.set(connectivity);
            }
        })
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
