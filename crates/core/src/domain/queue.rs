// Queue Domain Model

use serde::{Deserialize, Serialize};

use crate::domain::error::{DomainError, Result};

/// Queue identifier
pub type QueueName = String;

const MAX_QUEUE_NAME_LEN: usize = 64;

/// Persisted queue configuration
///
/// Created once per queue; `pop_width` at runtime is bounded by `max_pop_width`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: QueueName,
    pub max_pop_width: i64,
    pub max_pushes_per_pipe: i64,
    pub max_push_time_of_pipe_ms: i64,
    pub pop_pipe_refresh_delay_ms: i64,
}

impl QueueDescriptor {
    pub fn new(
        name: impl Into<String>,
        max_push_time_of_pipe_ms: i64,
        max_pushes_per_pipe: i64,
        max_pop_width: i64,
        pop_pipe_refresh_delay_ms: i64,
    ) -> Self {
        Self {
            name: name.into(),
            max_pop_width,
            max_pushes_per_pipe,
            max_push_time_of_pipe_ms,
            pop_pipe_refresh_delay_ms,
        }
    }

    /// Validate name charset and that every tunable is positive
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DomainError::ValidationError(
                "queue name is empty".to_string(),
            ));
        }
        if self.name.len() > MAX_QUEUE_NAME_LEN {
            return Err(DomainError::ValidationError(format!(
                "queue name too long ({} > {})",
                self.name.len(),
                MAX_QUEUE_NAME_LEN
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(DomainError::ValidationError(format!(
                "queue name must be alphanumeric, '_' or '-': {}",
                self.name
            )));
        }

        let tunables = [
            ("max_pop_width", self.max_pop_width),
            ("max_pushes_per_pipe", self.max_pushes_per_pipe),
            ("max_push_time_of_pipe_ms", self.max_push_time_of_pipe_ms),
            ("pop_pipe_refresh_delay_ms", self.pop_pipe_refresh_delay_ms),
        ];
        for (field, value) in tunables {
            if value <= 0 {
                return Err(DomainError::ValidationError(format!(
                    "{} must be positive, got {}",
                    field, value
                )));
            }
        }
        Ok(())
    }
}
