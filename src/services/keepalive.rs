use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::services::connection::Connection;

#[derive(Debug, Default)]
pub struct KeepaliveStats {
    probes_sent: AtomicU64,
    replies_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepaliveSnapshot {
    pub probes_sent: u64,
    pub replies_received: u64,
}

impl KeepaliveStats {
    pub fn record_probe(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KeepaliveSnapshot {
        KeepaliveSnapshot {
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Periodic probe task bound to one connection. Idle until started, and
/// stopped again on disconnect.
pub struct KeepaliveMonitor {
    interval: Duration,
    stats: Arc<KeepaliveStats>,
    running: Mutex<Option<Running>>,
}

impl KeepaliveMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stats: Arc::new(KeepaliveStats::default()),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> KeepaliveSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> Arc<KeepaliveStats> {
        self.stats.clone()
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Restarts the probe loop for `connection`. The first probe goes out one
    /// interval after the call.
    pub fn start(&self, connection: Weak<Connection>) {
        self.stop();

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop_rx => break,
                }
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if !connection.is_connected() {
                    continue;
                }
                if let Err(err) = connection.send_probe().await {
                    debug!(connection_id = %connection.id(), error = %err, "keepalive probe failed");
                }
            }
        });

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            stop: stop_tx,
            task,
        });
    }

    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let _ = running.stop.send(());
        }
    }
}

impl Drop for KeepaliveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
