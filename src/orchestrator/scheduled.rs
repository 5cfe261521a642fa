//! Scheduled mode: one timer task per trigger, all funnelled through the
//! session gate, plus a supervisor that reports once they are all done.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{SessionOrchestrator, SessionSlot, state::{BatchSummary, RunState}};
use crate::error::{PanelError, PanelResult};
use crate::relay::LogLevel;
use crate::request::ValidatedBatch;
use crate::schedule::{ScheduledTrigger, plan_triggers};

impl SessionOrchestrator {
    /// Fetch the schedule, arm one trigger per future entry and return the
    /// accepted state with the supervisor task.
    ///
    /// Nothing is armed when the schedule cannot be fetched or has no future
    /// entries; the orchestrator stays idle in that case.
    pub(super) async fn arm_schedule(
        self: &Arc<Self>,
        batch: ValidatedBatch,
    ) -> PanelResult<(RunState, JoinHandle<BatchSummary>)> {
        if !self.state.lock().await.is_idle() {
            return Err(PanelError::AlreadyRunning);
        }

        let entries = self.schedule.fetch().await?;
        let fetched = entries.len();
        let plan = plan_triggers(
            entries,
            Utc::now(),
            self.settings.default_trigger_size,
            batch.session_count as usize,
        );

        for past in &plan.discarded {
            self.relay
                .session(
                    LogLevel::Warning,
                    format!(
                        "Skipping arrival {}{}: already in the past",
                        past.clock_time.to_rfc3339(),
                        past.label
                            .as_deref()
                            .map(|l| format!(" ({l})"))
                            .unwrap_or_default()
                    ),
                )
                .await;
        }
        if plan.triggers.is_empty() {
            return Err(PanelError::Schedule(format!(
                "no upcoming arrivals in {} ({} entries fetched)",
                self.schedule.describe(),
                fetched
            )));
        }

        let total = plan.triggers.len() as u32;
        let (token, accepted) = self.begin(&batch, total, plan.triggers.clone()).await?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.supervise(batch, plan.triggers, token).await
        });
        Ok((accepted, handle))
    }

    async fn supervise(
        self: Arc<Self>,
        batch: ValidatedBatch,
        triggers: Vec<ScheduledTrigger>,
        token: CancellationToken,
    ) -> BatchSummary {
        let total = triggers.len() as u32;
        if let Some(first) = triggers.first().map(|t| t.trigger_time) {
            info!(armed = total, next = %first, source = %self.schedule.describe(), "schedule armed");
            self.relay
                .session(
                    LogLevel::Info,
                    format!(
                        "Armed {} triggers from {}; next at {}",
                        total,
                        self.schedule.describe(),
                        first.to_rfc3339()
                    ),
                )
                .await;
        }
        self.publish_status().await;

        let batch = Arc::new(batch);
        let mut timers = JoinSet::new();

        for (position, trigger) in triggers.into_iter().enumerate() {
            let this = Arc::clone(&self);
            let batch = Arc::clone(&batch);
            let token = token.clone();
            let slot = SessionSlot {
                index: position as u32 + 1,
                total,
            };
            timers.spawn(async move { this.fire_when_due(&batch, trigger, slot, &token).await });
        }

        let mut aborted = None;
        while let Some(joined) = timers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // A staging failure ends the whole schedule.
                    if aborted.is_none() {
                        aborted = Some(e.to_string());
                        token.cancel();
                    }
                }
                Err(e) => error!(error = %e, "trigger task ended abnormally"),
            }
        }

        self.finish(aborted).await
    }

    async fn fire_when_due(
        &self,
        batch: &ValidatedBatch,
        trigger: ScheduledTrigger,
        slot: SessionSlot,
        token: &CancellationToken,
    ) -> PanelResult<()> {
        let delay = trigger.delay_from(Utc::now());
        debug!(index = slot.index, ?delay, "trigger waiting");

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut state = self.state.lock().await;
            if let Some(armed) = state
                .triggers
                .iter_mut()
                .find(|t| t.trigger_time == trigger.trigger_time && !t.has_fired)
            {
                armed.has_fired = true;
            }
        }

        let label = trigger
            .label
            .as_deref()
            .map(|l| format!(" for {l}"))
            .unwrap_or_default();
        self.relay
            .session(
                LogLevel::Info,
                format!(
                    "Trigger {}/{}{} fired ({} UE)",
                    slot.index, slot.total, label, trigger.session_size
                ),
            )
            .await;

        self.run_session(batch, trigger.session_size, slot, token)
            .await
            .map(|_| ())
    }
}
