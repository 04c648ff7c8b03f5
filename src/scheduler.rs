// Protocol period scheduler
//
// Drives the engine through its three phases on a fixed period and issues
// periodic full-list requests. The indirect-probe deadline adapts to the
// observed RTT percentile. Sleeps are cooperative: they run in slices of
// `max_sleep_duration` and check the shutdown flag on every slice, trading
// shutdown latency against CPU wakeups.

use crate::error::Result;
use crate::membership::MembershipEngine;
use crate::rtt::RttTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Runs the protocol-period loop and the list-request loop as background
/// tasks until `stop` is called.
pub struct Scheduler {
    engine: Arc<MembershipEngine>,
    rtt: Arc<RttTracker>,
    protocol_period: Duration,
    max_sleep_duration: Duration,
    list_request_interval: Duration,
    shutdown: Arc<AtomicBool>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<MembershipEngine>,
        rtt: Arc<RttTracker>,
        protocol_period: Duration,
        max_sleep_duration: Duration,
        list_request_interval: Duration,
    ) -> Self {
        Self {
            engine,
            rtt,
            protocol_period,
            max_sleep_duration,
            list_request_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    /// Spawn the protocol-period loop and the list-request loop. The first
    /// list request fires immediately.
    pub async fn start(&mut self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let engine = self.engine.clone();
        let rtt = self.rtt.clone();
        let protocol_period = self.protocol_period;
        let max_sleep = self.max_sleep_duration;
        let shutdown = self.shutdown.clone();

        self.handles.push(tokio::spawn(async move {
            let mut period_start = Instant::now();
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = engine.direct_ping() {
                    tracing::warn!(error = %e, "direct ping phase failed");
                }

                let expected_rtt = rtt.update();
                let indirect_at = period_start + expected_rtt;
                if indirect_at.saturating_duration_since(Instant::now()) < expected_rtt / 2 {
                    tracing::warn!(expected_rtt = ?expected_rtt,
                        "protocol period overloaded, indirect probe window is short");
                }
                if sleep_until(indirect_at, max_sleep, &shutdown).await {
                    break;
                }

                if let Err(e) = engine.indirect_ping() {
                    tracing::warn!(error = %e, "indirect ping phase failed");
                }

                if sleep_until(period_start + protocol_period, max_sleep, &shutdown).await {
                    break;
                }

                if let Err(e) = engine.end_of_protocol_period() {
                    tracing::warn!(error = %e, "end of protocol period failed");
                }

                period_start += protocol_period;
            }
            tracing::debug!("protocol period loop stopped");
        }));

        let engine = self.engine.clone();
        let list_request_interval = self.list_request_interval;

        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(list_request_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.request_list() {
                            tracing::warn!(error = %e, "list request failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            tracing::debug!("list request loop stopped");
        }));

        Ok(())
    }

    /// Stop both loops, then broadcast our own departure. The broadcast
    /// error is propagated: it is the caller's last chance to know.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        self.engine.shutdown_broadcast()
    }
}

/// Sleep toward `deadline` in shutdown-checked slices. Returns true if the
/// shutdown flag was raised.
async fn sleep_until(deadline: Instant, max_slice: Duration, shutdown: &AtomicBool) -> bool {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let remaining = deadline - now;
        tokio::time::sleep(remaining.min(max_slice)).await;
    }
}
