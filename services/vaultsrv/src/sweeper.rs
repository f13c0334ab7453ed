//! Periodic sweep driver
//!
//! Runs the engine's sweep on a fixed interval until told to stop. The
//! trigger is at-least-once: an external scheduler hitting the sweep route
//! while this loop runs is harmless, because every transition is a
//! conditional write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::engine::EscalationEngine;

pub struct Sweeper {
    engine: Arc<EscalationEngine>,
    period: Duration,
    shutdown: Arc<tokio::sync::Notify>,
    running: Arc<AtomicBool>,
}

impl Sweeper {
    pub fn new(engine: Arc<EscalationEngine>, period_secs: u64) -> Self {
        Self {
            engine,
            period: Duration::from_secs(period_secs),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the sweep loop until `stop()` is called
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("sweeper already running");
            return;
        }

        info!("sweeper started, period {}s", self.period.as_secs());
        let mut tick = interval(self.period);
        // The immediate first tick would sweep at startup; let one period
        // elapse first
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.engine.sweep().await {
                        Ok(report) => {
                            if report.advanced > 0 || report.disclosed > 0 {
                                info!(
                                    "periodic sweep: {} advanced, {} disclosed",
                                    report.advanced, report.disclosed
                                );
                            }
                        },
                        Err(e) => error!("periodic sweep failed: {}", e),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("sweeper received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        info!("sweeper stopped");
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}
