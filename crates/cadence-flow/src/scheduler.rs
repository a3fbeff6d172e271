use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadence_core::config::SchedulerConfig;
use cadence_core::traits::{Clock, FlowStore};
use cadence_core::types::TriggerKind;

use crate::engine::FlowEngine;

/// Time-based collaborator for the engine.
///
/// Two duties per tick: wake paused runs whose `resume_at` has passed
/// (long `delay` nodes park runs instead of blocking a worker), and start
/// `schedule`-trigger flows whose cron expression fired inside the elapsed
/// window. Failures are isolated per run and per flow.
pub struct FlowScheduler {
    store: Arc<dyn FlowStore>,
    engine: Arc<FlowEngine>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FlowScheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn FlowStore>,
        engine: Arc<FlowEngine>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            engine,
            clock,
            poll_interval: Duration::from_secs(config.poll_secs.max(1)),
            cancel,
        }
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(poll_secs = self.poll_interval.as_secs(), "Flow scheduler started");
        let mut last_tick = self.clock.now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    let now = self.clock.now();
                    self.tick(last_tick, now).await;
                    last_tick = now;
                }
                _ = self.cancel.cancelled() => {
                    info!("Flow scheduler stopped");
                    break;
                }
            }
        }
    }

    /// One scheduler pass over the window `(since, now]`.
    pub async fn tick(&self, since: DateTime<Utc>, now: DateTime<Utc>) {
        self.wake_due_runs(now).await;
        self.fire_schedules(since, now).await;
    }

    async fn wake_due_runs(&self, now: DateTime<Utc>) {
        let due = match self.store.due_runs(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to query due runs");
                return;
            }
        };

        for run_id in due {
            debug!(run_id = %run_id, "Waking delayed run");
            if let Err(e) = self.engine.resume_flow(&run_id, HashMap::new()).await {
                error!(run_id = %run_id, error = %e, "Failed to resume delayed run");
            }
        }
    }

    async fn fire_schedules(&self, since: DateTime<Utc>, now: DateTime<Utc>) {
        let flows = match self.store.list_active_by_trigger(TriggerKind::Schedule).await {
            Ok(flows) => flows,
            Err(e) => {
                error!(error = %e, "Failed to list schedule flows");
                return;
            }
        };

        for flow in flows {
            let Some(expr) = flow.trigger_config.get("cron").and_then(|v| v.as_str()) else {
                warn!(flow_id = %flow.id, "Schedule flow without a cron expression, skipping");
                continue;
            };

            let schedule = match Schedule::from_str(expr) {
                Ok(s) => s,
                Err(e) => {
                    warn!(flow_id = %flow.id, cron = %expr, error = %e, "Invalid cron expression, skipping");
                    continue;
                }
            };

            let fired = schedule.after(&since).next().is_some_and(|t| t <= now);
            if !fired {
                continue;
            }

            info!(flow_id = %flow.id, cron = %expr, "Firing schedule flow");
            let mut data = HashMap::new();
            data.insert(
                "scheduledAt".to_string(),
                serde_json::Value::String(now.to_rfc3339()),
            );
            if let Err(e) = self.engine.start_flow(&flow.id, None, None, data).await {
                error!(flow_id = %flow.id, error = %e, "Schedule flow failed to start");
            }
        }
    }
}
