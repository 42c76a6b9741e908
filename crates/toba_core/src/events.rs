//! Progress and log events published while a plan, backup or restore runs.
//!
//! Sinks are append-only and one-directional: the engine publishes, consumers
//! (a console reporter, a log file, a UI) only listen. Publishing never fails
//! and never blocks on a slow consumer.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::DeviceMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    PlanStarted {
        serial: String,
        steps: usize,
        mode: DeviceMode,
    },
    StepStarted {
        index: usize,
        line: usize,
        description: String,
    },
    /// Byte progress of a transfer. `total` is 0 when unknown.
    Progress {
        index: usize,
        partition: String,
        done: u64,
        total: u64,
    },
    StepFinished {
        index: usize,
        status: StepStatus,
        detail: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    PlanFinished {
        succeeded: bool,
        summary: String,
    },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: ExecutionEvent);
}

/// Drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: ExecutionEvent) {}
}

/// Forwards events to `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::PlanStarted { serial, steps, mode } => {
                info!(%serial, steps, %mode, "plan started")
            }
            ExecutionEvent::StepStarted {
                index,
                line,
                description,
            } => info!(step = index, line, "{}", description),
            ExecutionEvent::Progress {
                index,
                partition,
                done,
                total,
            } => debug!(step = index, %partition, done, total, "progress"),
            ExecutionEvent::StepFinished { index, status, detail } => match status {
                StepStatus::Failed => warn!(step = index, ?status, detail = detail.as_deref(), "step finished"),
                _ => info!(step = index, ?status, detail = detail.as_deref(), "step finished"),
            },
            ExecutionEvent::Log { level, message } => match level {
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
            },
            ExecutionEvent::PlanFinished { succeeded, summary } => info!(succeeded, "{}", summary),
        }
    }
}

/// Broadcasts to any number of passive subscribers. Subscribers that fall
/// behind by more than the channel capacity lose the oldest events.
pub struct ChannelSink {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: ExecutionEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

/// Keeps every event. Handy for tests and for writing a run log afterwards.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: ExecutionEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}
