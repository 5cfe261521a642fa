//! Run state owned by the session orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::identifier::Msin;
use crate::relay::LogLine;
use crate::request::{RunMode, ValidatedBatch};
use crate::schedule::ScheduledTrigger;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Stopping,
}

/// What happened in one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub index: u32,
    pub identifier: Msin,
    pub ues: u32,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal report of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub mode: RunMode,
    pub sessions_run: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub identifiers_consumed: u64,
    pub next_identifier: Option<Msin>,
    pub cancelled: bool,
    pub aborted: Option<String>,
    pub sessions: Vec<SessionRecord>,
    /// Output captured from the last session that ran.
    pub last_output: String,
    pub last_error: String,
}

impl BatchSummary {
    /// True when every session ran and succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.aborted.is_none() && !self.cancelled && self.failed == 0 && self.sessions_run > 0
    }

    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} sessions run, {} succeeded, {} failed, {} identifiers consumed",
            self.sessions_run, self.succeeded, self.failed, self.identifiers_consumed
        );
        if self.cancelled {
            line.push_str(" (stopped)");
        }
        if let Some(reason) = &self.aborted {
            line.push_str(&format!(" (aborted: {reason})"));
        }
        line
    }

    /// Counters only, without per-session records or captured output.
    pub fn without_detail(&self) -> BatchSummary {
        BatchSummary {
            mode: self.mode,
            sessions_run: self.sessions_run,
            succeeded: self.succeeded,
            failed: self.failed,
            identifiers_consumed: self.identifiers_consumed,
            next_identifier: self.next_identifier.clone(),
            cancelled: self.cancelled,
            aborted: self.aborted.clone(),
            ..Default::default()
        }
    }
}

/// Per-session detail of the active batch. Kept apart from [`RunState`] so
/// status frames never carry it.
#[derive(Debug, Default)]
pub(crate) struct SessionHistory {
    pub(crate) records: Vec<SessionRecord>,
    pub(crate) last_output: String,
    pub(crate) last_error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub phase: RunPhase,
    pub mode: Option<RunMode>,
    pub current_index: u32,
    pub total_count: u32,
    /// Next identifier to assign; `None` once the width is exhausted.
    pub current_identifier: Option<Msin>,
    pub ues_per_session: u32,
    pub cancel_requested: bool,
    pub sessions_run: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub identifiers_consumed: u64,
    pub triggers: Vec<ScheduledTrigger>,
    pub started_at: Option<DateTime<Utc>>,
    /// Counters of the previous batch.
    pub last_summary: Option<BatchSummary>,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

impl RunState {
    pub fn is_idle(&self) -> bool {
        self.phase == RunPhase::Idle
    }

    /// Reset counters for a new batch and move to `Running`.
    pub(crate) fn begin(&mut self, batch: &ValidatedBatch, total: u32) -> CancellationToken {
        let last_summary = self.last_summary.take();
        *self = RunState {
            phase: RunPhase::Running,
            mode: Some(batch.mode),
            total_count: total,
            current_identifier: Some(batch.base.clone()),
            ues_per_session: batch.ues_per_session,
            started_at: Some(Utc::now()),
            last_summary,
            cancel: CancellationToken::new(),
            ..Default::default()
        };
        self.cancel.clone()
    }

    /// Unfired triggers, soonest first.
    pub fn upcoming(&self) -> Vec<ScheduledTrigger> {
        let mut pending: Vec<_> = self.triggers.iter().filter(|t| !t.has_fired).cloned().collect();
        pending.sort_by_key(|t| t.trigger_time);
        pending
    }

    pub(crate) fn summary(&self, history: SessionHistory, aborted: Option<String>) -> BatchSummary {
        BatchSummary {
            mode: self.mode.unwrap_or_default(),
            sessions_run: self.sessions_run,
            succeeded: self.succeeded,
            failed: self.failed,
            identifiers_consumed: self.identifiers_consumed,
            next_identifier: self.current_identifier.clone(),
            cancelled: self.cancel_requested,
            aborted,
            sessions: history.records,
            last_output: history.last_output,
            last_error: history.last_error,
        }
    }
}

/// Run state plus both log buffers, as served to the panel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub state: RunState,
    pub upcoming: Vec<ScheduledTrigger>,
    pub session_log: Vec<LogLine>,
    pub process_output_log: Vec<LogLine>,
}
