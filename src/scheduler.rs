//! Timer-driven reset scheduling
//!
//! Thin driver over the orchestrator: periodically checks each core's
//! persisted schedule and runs a reset pass for any core whose `next_reset`
//! has passed. The schedule itself lives in the store; this loop only reads
//! it and records completed passes.

use crate::core::Core;
use crate::db::Database;
use crate::reset::ResetOrchestrator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct ResetScheduler {
    db: Arc<Database>,
    orchestrator: Arc<ResetOrchestrator>,
    tick: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ResetScheduler {
    pub fn new(
        db: Arc<Database>,
        orchestrator: Arc<ResetOrchestrator>,
        tick: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            orchestrator,
            tick,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(tick_secs = self.tick.as_secs(), "Reset scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {
                    self.tick_once().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Reset scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick_once(&self) {
        let now = Utc::now();

        for core in Core::ALL {
            let config = match self.db.get_reset_config(core) {
                Ok(config) => config,
                Err(e) => {
                    error!(core = %core, error = %e, "failed to load reset schedule");
                    continue;
                }
            };

            let due = config.enabled && config.next_reset.map(|t| t <= now).unwrap_or(false);
            if !due {
                continue;
            }

            info!(core = %core, "scheduled reset due");
            if let Err(e) = self.orchestrator.reset_core(core).await {
                error!(core = %core, error = %e, "scheduled reset failed");
            }
            if let Err(e) = self.db.mark_reset(core, Utc::now()) {
                error!(core = %core, error = %e, "failed to record scheduled reset");
            }
        }
    }
}
