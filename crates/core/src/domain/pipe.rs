// Pipe Domain Model
//
// A pipe is one bounded FIFO segment of a queue. Its id doubles as its
// creation order: "oldest pipe" is decided by comparing ids, never by a
// separate timestamp column.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::error::{DomainError, Result};
use crate::domain::queue::QueueName;

/// Pipe ID (time-ordered, compared lexicographically)
pub type PipeId = String;

/// Pipe lifecycle status
///
/// Transitions only move forward:
/// `PUSH_ACTIVE -> NOT_ACTIVE -> PUSH_FINISHED -> FINISHED_AND_EMPTY`,
/// with any non-terminal status allowed to jump straight to `FINISHED_AND_EMPTY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipeStatus {
    PushActive,
    NotActive,
    PushFinished,
    FinishedAndEmpty,
}

impl PipeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeStatus::PushActive => "PUSH_ACTIVE",
            PipeStatus::NotActive => "NOT_ACTIVE",
            PipeStatus::PushFinished => "PUSH_FINISHED",
            PipeStatus::FinishedAndEmpty => "FINISHED_AND_EMPTY",
        }
    }

    /// Whether the pipe may still receive pushes
    pub fn is_push_accepting(&self) -> bool {
        matches!(self, PipeStatus::PushActive)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipeStatus::FinishedAndEmpty)
    }

    /// Forward-only check. Staying in the same status is not a transition.
    pub fn can_transition_to(&self, next: PipeStatus) -> bool {
        next > *self
    }
}

impl std::fmt::Display for PipeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipeStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PUSH_ACTIVE" => Ok(PipeStatus::PushActive),
            "NOT_ACTIVE" => Ok(PipeStatus::NotActive),
            "PUSH_FINISHED" => Ok(PipeStatus::PushFinished),
            "FINISHED_AND_EMPTY" => Ok(PipeStatus::FinishedAndEmpty),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Pipe Descriptor - metadata for one segment of a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeDescriptor {
    pub pipe_id: PipeId,
    pub queue_name: QueueName,
    pub status: PipeStatus,
    pub push_count: i64,
    pub push_start_timestamp: i64, // epoch ms
}

impl PipeDescriptor {
    /// Create a fresh push-active descriptor
    pub fn new(
        pipe_id: impl Into<String>,
        queue_name: impl Into<String>,
        push_start_timestamp: i64,
    ) -> Self {
        Self {
            pipe_id: pipe_id.into(),
            queue_name: queue_name.into(),
            status: PipeStatus::PushActive,
            push_count: 0,
            push_start_timestamp,
        }
    }

    /// Age-based expiry of the push window, independent of the stored status
    pub fn is_push_expired(&self, now_millis: i64, max_push_time_ms: i64) -> bool {
        now_millis - self.push_start_timestamp > max_push_time_ms
    }

    pub fn is_full(&self, max_pushes_per_pipe: i64) -> bool {
        self.push_count >= max_pushes_per_pipe
    }

    /// A pipe whose waiting list is empty may be declared finished unless it
    /// is still push-active and inside its push window.
    pub fn is_closable(&self, now_millis: i64, max_push_time_ms: i64) -> bool {
        match self.status {
            PipeStatus::PushActive => self.is_push_expired(now_millis, max_push_time_ms),
            PipeStatus::NotActive | PipeStatus::PushFinished => true,
            PipeStatus::FinishedAndEmpty => false,
        }
    }

    /// Apply a status transition locally, rejecting backward moves
    pub fn transition_to(&mut self, next: PipeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStatusTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

impl std::fmt::Display for PipeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pipe {} (queue={}, status={}, push_count={})",
            self.pipe_id, self.queue_name, self.status, self.push_count
        )
    }
}
