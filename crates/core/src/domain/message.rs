// Message Domain Model

use serde::{Deserialize, Serialize};

use crate::domain::pipe::PipeId;

/// Message ID (time-ordered, compared lexicographically)
pub type MsgId = String;

/// A message living in exactly one pipe's waiting or delivered list.
///
/// Equality is identity-based: two values are the same message when their
/// ids and pipes match, regardless of which list they were read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub msg_id: MsgId,
    pub pipe_id: PipeId,
    pub payload: Vec<u8>,
}

impl QueueMessage {
    pub fn new(msg_id: impl Into<String>, pipe_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_id: msg_id.into(),
            pipe_id: pipe_id.into(),
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid text
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl PartialEq for QueueMessage {
    fn eq(&self, other: &Self) -> bool {
        self.msg_id == other.msg_id && self.pipe_id == other.pipe_id
    }
}

impl Eq for QueueMessage {}

impl std::fmt::Display for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "msg {} (pipe={}, {} bytes)",
            self.msg_id,
            self.pipe_id,
            self.payload.len()
        )
    }
}
