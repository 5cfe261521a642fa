//! Session orchestration: turns a validated batch into a sequence of
//! patch-then-run sessions and keeps the run state observers see.
//!
//! Exactly one batch runs at a time. Every session, immediate or scheduled,
//! goes through [`SessionOrchestrator::run_session`], which holds the
//! session gate for the whole patch-and-run so that the staged identifier
//! is the one the simulator reads.

mod scheduled;
mod state;


pub use state::{BatchSummary, RunPhase, RunSnapshot, RunState, SessionRecord};

use state::SessionHistory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PanelConfig;
use crate::error::{PanelError, PanelResult};
use crate::identifier::IdentifierError;
use crate::patcher::{ConfigPatcher, StagedIdentity, YamlConfigPatcher};
use crate::relay::{LogLevel, LogRelay, RelayEvent};
use crate::request::{BatchLimits, BatchRequest, RunMode, ValidatedBatch};
use crate::runner::{ChildProcessRunner, Invocation, ProcessRunner, RunOutcome, session_args};
use crate::schedule::{ScheduleEntry, ScheduleSource, ScheduledTrigger};
use crate::types::SessionLabel;

/// Knobs the orchestrator needs from the panel config.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub executable: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub session_timeout: Duration,
    pub limits: BatchLimits,
    /// Size of a scheduled trigger whose entry carries none.
    pub default_trigger_size: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &PanelConfig) -> Self {
        Self {
            executable: config.binary_path.clone(),
            working_dir: Some(config.working_dir()),
            session_timeout: config.session_timeout(),
            limits: config.limits(),
            default_trigger_size: config.schedule.default_session_size.max(1),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./packetrusher"),
            working_dir: None,
            session_timeout: Duration::from_secs(30),
            limits: BatchLimits::default(),
            default_trigger_size: 1,
        }
    }
}

/// Position of a session within its batch, for log lines.
#[derive(Debug, Clone, Copy)]
struct SessionSlot {
    index: u32,
    total: u32,
}

pub struct SessionOrchestrator {
    settings: OrchestratorSettings,
    patcher: Arc<dyn ConfigPatcher>,
    runner: Arc<dyn ProcessRunner>,
    relay: Arc<LogRelay>,
    schedule: Arc<dyn ScheduleSource>,
    state: Mutex<RunState>,
    history: Mutex<SessionHistory>,
    /// `true` whenever no batch is active.
    idle: watch::Sender<bool>,
    session_gate: Mutex<()>,
    batch_task: Mutex<Option<JoinHandle<BatchSummary>>>,
}

impl SessionOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        patcher: Arc<dyn ConfigPatcher>,
        runner: Arc<dyn ProcessRunner>,
        relay: Arc<LogRelay>,
        schedule: Arc<dyn ScheduleSource>,
    ) -> Arc<Self> {
        let (idle, _) = watch::channel(true);
        Arc::new(Self {
            settings,
            patcher,
            runner,
            relay,
            schedule,
            state: Mutex::new(RunState::default()),
            history: Mutex::new(SessionHistory::default()),
            idle,
            session_gate: Mutex::new(()),
            batch_task: Mutex::new(None),
        })
    }

    /// Wire the real YAML patcher, child-process runner and schedule source.
    pub fn from_config(config: &PanelConfig) -> PanelResult<Arc<Self>> {
        let patcher = YamlConfigPatcher::new(config.simulator_config_path(), config.endpoints.clone());
        info!(
            binary = %config.binary_path.display(),
            simulator_config = %patcher.path().display(),
            "session orchestrator configured"
        );
        Ok(Self::new(
            OrchestratorSettings::from_config(config),
            Arc::new(patcher),
            Arc::new(ChildProcessRunner::new(config.kill_grace())),
            Arc::new(LogRelay::new(config.log_capacity)),
            config.schedule_source()?,
        ))
    }

    pub fn relay(&self) -> &Arc<LogRelay> {
        &self.relay
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn patcher(&self) -> &Arc<dyn ConfigPatcher> {
        &self.patcher
    }

    /// Validate and launch a batch in the background.
    ///
    /// Returns as soon as the batch is accepted; progress is reported through
    /// the relay. Fails with `AlreadyRunning` unless the orchestrator is idle.
    pub async fn start(self: &Arc<Self>, request: &BatchRequest) -> PanelResult<RunState> {
        let batch = request.validate(&self.settings.limits)?;

        let (accepted, handle) = match batch.mode {
            RunMode::ImmediateBatch => {
                let (token, accepted) = self.begin(&batch, batch.session_count, Vec::new()).await?;
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.drive_immediate(batch, token).await });
                (accepted, handle)
            }
            RunMode::ScheduledBatch => self.arm_schedule(batch).await?,
        };
        *self.batch_task.lock().await = Some(handle);

        Ok(accepted)
    }

    /// Validate and run a batch to completion.
    ///
    /// The batch runs in its own task, so it still reaches idle if the
    /// caller stops waiting.
    pub async fn run_batch(self: &Arc<Self>, request: &BatchRequest) -> PanelResult<BatchSummary> {
        let batch = request.validate(&self.settings.limits)?;

        let handle = match batch.mode {
            RunMode::ImmediateBatch => {
                let (token, _) = self.begin(&batch, batch.session_count, Vec::new()).await?;
                let this = Arc::clone(self);
                tokio::spawn(async move { this.drive_immediate(batch, token).await })
            }
            RunMode::ScheduledBatch => self.arm_schedule(batch).await?.1,
        };
        handle
            .await
            .map_err(|e| PanelError::Configuration(format!("batch task failed: {e}")))
    }

    /// Wait for the active batch, however it was launched.
    ///
    /// Returns the full summary of a batch started by [`start`](Self::start),
    /// the counters of one started by [`run_batch`](Self::run_batch), or
    /// `None` when nothing was running.
    pub async fn wait_for_completion(&self) -> Option<BatchSummary> {
        let handle = self.batch_task.lock().await.take();
        let started = match handle {
            Some(handle) => match handle.await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    error!(error = %e, "batch task ended abnormally");
                    None
                }
            },
            None => None,
        };

        // Anything still active was launched by `run_batch`.
        let mut idle = self.idle.subscribe();
        if *idle.borrow_and_update() {
            return started;
        }
        // The sender lives in `self`, so this only returns once idle.
        let _ = idle.wait_for(|idle| *idle).await;
        self.state.lock().await.last_summary.clone()
    }

    /// Request cancellation of the active batch.
    ///
    /// Returns `false` when nothing was running. The session in flight, if
    /// any, is allowed to finish; no further session starts.
    pub async fn stop(&self) -> bool {
        let (mode, dropped) = {
            let mut state = self.state.lock().await;
            if state.is_idle() {
                return false;
            }
            state.cancel_requested = true;
            state.cancel.cancel();
            let dropped = state.triggers.iter().filter(|t| !t.has_fired).count();
            state.triggers.clear();
            if state.mode == Some(RunMode::ScheduledBatch) {
                state.phase = RunPhase::Stopping;
            }
            (state.mode, dropped)
        };

        let message = match mode {
            Some(RunMode::ScheduledBatch) => {
                format!("Stop requested; {dropped} pending triggers cancelled")
            }
            _ => "Stop requested; finishing the current session".to_string(),
        };
        info!("{message}");
        self.relay.session(LogLevel::Warning, message).await;
        self.publish_status().await;
        true
    }

    pub async fn state(&self) -> RunState {
        self.state.lock().await.clone()
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        let state = self.state().await;
        let logs = self.relay.snapshot().await;
        RunSnapshot {
            upcoming: state.upcoming(),
            state,
            session_log: logs.session_log,
            process_output_log: logs.process_output_log,
        }
    }

    pub async fn upcoming_triggers(&self) -> Vec<ScheduledTrigger> {
        self.state.lock().await.upcoming()
    }

    /// Fetch the schedule without arming anything.
    pub async fn fetch_schedule(&self) -> PanelResult<Vec<ScheduleEntry>> {
        self.schedule.fetch().await
    }

    pub fn schedule_source(&self) -> String {
        self.schedule.describe()
    }

    pub async fn clear_logs(&self) {
        self.relay.clear().await;
    }

    /// Atomically move from idle to running and return the accepted state.
    ///
    /// Callers spawn the batch task right after this without awaiting
    /// anything else, so the task that calls [`finish`](Self::finish) always
    /// exists once the state has left idle.
    async fn begin(
        &self,
        batch: &ValidatedBatch,
        total: u32,
        triggers: Vec<ScheduledTrigger>,
    ) -> PanelResult<(CancellationToken, RunState)> {
        let (token, accepted) = {
            let mut state = self.state.lock().await;
            if !state.is_idle() {
                return Err(PanelError::AlreadyRunning);
            }
            self.idle.send_replace(false);
            let token = state.begin(batch, total);
            state.triggers = triggers;
            (token, state.clone())
        };
        info!(
            mode = batch.mode.as_str(),
            base = %batch.base,
            total,
            ues_per_session = batch.ues_per_session,
            "batch started"
        );
        Ok((token, accepted))
    }

    async fn drive_immediate(self: Arc<Self>, batch: ValidatedBatch, token: CancellationToken) -> BatchSummary {
        self.relay
            .session(
                LogLevel::Info,
                format!(
                    "Starting {} sessions from identifier {} ({} UE per session)",
                    batch.session_count, batch.base, batch.ues_per_session
                ),
            )
            .await;
        self.publish_status().await;

        let mut aborted = None;
        for index in 1..=batch.session_count {
            if token.is_cancelled() {
                break;
            }
            let slot = SessionSlot {
                index,
                total: batch.session_count,
            };
            if let Err(e) = self
                .run_session(&batch, batch.ues_per_session, slot, &token)
                .await
            {
                aborted = Some(e.to_string());
                break;
            }
        }

        self.finish(aborted).await
    }

    /// Stage the next identifier and run one session of `ues` devices.
    ///
    /// `Ok(None)` means the batch was cancelled before the session started.
    /// An error is fatal to the batch; a failed simulator run is not.
    async fn run_session(
        &self,
        batch: &ValidatedBatch,
        ues: u32,
        slot: SessionSlot,
        token: &CancellationToken,
    ) -> PanelResult<Option<RunOutcome>> {
        let _gate = self.session_gate.lock().await;
        if token.is_cancelled() {
            return Ok(None);
        }

        let msin = {
            let mut state = self.state.lock().await;
            state.current_index = slot.index;
            state
                .current_identifier
                .clone()
                .ok_or(PanelError::InvalidIdentifier(IdentifierError::Exhausted))?
        };
        // The whole range this session consumes has to fit the width.
        msin.next(u64::from(ues) - 1)?;
        self.publish_status().await;

        let label = SessionLabel::for_identifier(&msin);
        self.relay
            .session(
                LogLevel::Info,
                format!(
                    "Session {}/{}: staging identifier {} ({} UE)",
                    slot.index, slot.total, msin, ues
                ),
            )
            .await;

        let identity = StagedIdentity {
            msin: msin.clone(),
            country: Some(batch.country.clone()),
            network: Some(batch.network.clone()),
            overrides: batch.overrides.clone(),
        };
        if let Err(e) = self.patcher.apply(&identity).await {
            error!(session = %label, error = %e, "staging identifier failed");
            self.relay
                .session(LogLevel::Error, format!("Cannot stage identifier {msin}: {e}"))
                .await;
            return Err(e);
        }

        let invocation = Invocation::new(&self.settings.executable, session_args(ues), label.clone())
            .with_cwd(self.settings.working_dir.clone())
            .with_timeout(self.settings.session_timeout);
        let outcome = self.runner.run(invocation, &self.relay).await;
        let failure = outcome.failure();

        {
            let mut state = self.state.lock().await;
            state.sessions_run += 1;
            state.identifiers_consumed += u64::from(ues);
            if failure.is_none() {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
            // Identifiers advance whether or not the session succeeded.
            state.current_identifier = msin.next(u64::from(ues)).ok();
        }
        {
            let mut history = self.history.lock().await;
            history.records.push(SessionRecord {
                index: slot.index,
                identifier: msin.clone(),
                ues,
                success: failure.is_none(),
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                error: failure.as_ref().map(ToString::to_string),
            });
            history.last_output = outcome.captured_output.clone();
            history.last_error = outcome.captured_error.clone();
        }

        match &failure {
            None => {
                self.relay
                    .session(
                        LogLevel::Success,
                        format!("Session {}/{} ({}) completed", slot.index, slot.total, msin),
                    )
                    .await
            }
            Some(e) => {
                warn!(session = %label, error = %e, "session failed");
                self.relay
                    .session(
                        LogLevel::Error,
                        format!("Session {}/{} ({}) failed: {}", slot.index, slot.total, msin, e),
                    )
                    .await
            }
        }
        self.publish_status().await;

        Ok(Some(outcome))
    }

    /// Return to idle and report.
    async fn finish(&self, aborted: Option<String>) -> BatchSummary {
        let history = std::mem::take(&mut *self.history.lock().await);
        let summary = {
            let mut state = self.state.lock().await;
            let summary = state.summary(history, aborted);
            state.phase = RunPhase::Idle;
            state.triggers.clear();
            state.last_summary = Some(summary.without_detail());
            self.idle.send_replace(true);
            summary
        };

        let level = if summary.aborted.is_some() {
            LogLevel::Error
        } else if summary.cancelled || summary.failed > 0 {
            LogLevel::Warning
        } else {
            LogLevel::Success
        };
        info!(
            sessions_run = summary.sessions_run,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "batch finished"
        );
        self.relay
            .session(level, format!("Batch finished: {}", summary.describe()))
            .await;
        self.publish_status().await;

        summary
    }

    async fn publish_status(&self) {
        let status = {
            let state = self.state.lock().await;
            serde_json::to_value(&*state)
        };
        match status {
            Ok(value) => {
                self.relay.broadcast(RelayEvent::Status(value)).await;
            }
            Err(e) => warn!(error = %e, "cannot serialize run status"),
        }
    }
}
