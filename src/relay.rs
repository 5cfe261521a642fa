//! Live log relay: best-effort fan-out to connected observers.
//!
//! Observers register an unbounded channel and get every event broadcast
//! after they joined. A closed channel is skipped and pruned during the
//! broadcast that notices it. The relay also keeps the two bounded log
//! buffers that a fresh observer can read as its initial snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::types::SessionLabel;

pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One timestamped line in a log buffer or on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionLabel>,
}

/// Events pushed to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RelayEvent {
    #[serde(rename = "packetrusher-log")]
    Log(LogLine),
    #[serde(rename = "session-log")]
    Session(LogLine),
    #[serde(rename = "run-status")]
    Status(serde_json::Value),
    #[serde(rename = "logs-cleared")]
    LogsCleared,
}

/// Fixed-capacity ring buffer; oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: LogLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines in display order, newest first.
    pub fn newest_first(&self) -> Vec<LogLine> {
        self.lines.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    pub session_log: Vec<LogLine>,
    pub process_output_log: Vec<LogLine>,
}

struct Buffers {
    session: LogBuffer,
    output: LogBuffer,
}

pub struct LogRelay {
    observers: RwLock<HashMap<Uuid, mpsc::UnboundedSender<RelayEvent>>>,
    buffers: RwLock<Buffers>,
}

impl LogRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            buffers: RwLock::new(Buffers {
                session: LogBuffer::new(capacity),
                output: LogBuffer::new(capacity),
            }),
        }
    }

    /// Register a new observer. It only sees events broadcast from now on.
    pub async fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.observers.write().await.insert(id, tx);
        tracing::debug!(observer = %id, "observer connected");
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.observers.write().await.remove(&id).is_some() {
            tracing::debug!(observer = %id, "observer disconnected");
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Send `event` to every live observer. Returns how many received it.
    pub async fn broadcast(&self, event: RelayEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let observers = self.observers.read().await;
            for (id, tx) in observers.iter() {
                if tx.is_closed() || tx.send(event.clone()).is_err() {
                    dead.push(*id);
                } else {
                    delivered += 1;
                }
            }
        }
        if !dead.is_empty() {
            let mut observers = self.observers.write().await;
            for id in dead {
                observers.remove(&id);
            }
        }
        delivered
    }

    /// Record an orchestrator message and relay it.
    pub async fn session(&self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine {
            message: message.into(),
            level,
            timestamp: Utc::now(),
            session: None,
        };
        self.buffers.write().await.session.push(line.clone());
        self.broadcast(RelayEvent::Session(line)).await;
    }

    /// Record one line of simulator output and relay it.
    pub async fn process_output(
        &self,
        level: LogLevel,
        session: &SessionLabel,
        message: impl Into<String>,
    ) {
        let line = LogLine {
            message: message.into(),
            level,
            timestamp: Utc::now(),
            session: Some(session.clone()),
        };
        self.buffers.write().await.output.push(line.clone());
        self.broadcast(RelayEvent::Log(line)).await;
    }

    pub async fn snapshot(&self) -> LogSnapshot {
        let buffers = self.buffers.read().await;
        LogSnapshot {
            session_log: buffers.session.newest_first(),
            process_output_log: buffers.output.newest_first(),
        }
    }

    pub async fn clear(&self) {
        {
            let mut buffers = self.buffers.write().await;
            buffers.session.clear();
            buffers.output.clear();
        }
        self.broadcast(RelayEvent::LogsCleared).await;
    }
}

impl Default for LogRelay {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
