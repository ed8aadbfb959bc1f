// Queue Repository Port (Storage Interface)
//
// Durable pipe/message operations the queue protocol is built on. No queue
// semantics live behind this trait; ordering, closing and requeueing are
// decided by the application layer.

use crate::domain::{MsgId, PipeDescriptor, PipeId, PipeStatus, QueueDescriptor, QueueMessage};
use crate::error::Result;
use async_trait::async_trait;

/// Repository interface for queue persistence
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Persist a queue descriptor, replacing any existing one with the same name
    async fn create_queue_descriptor(&self, desc: &QueueDescriptor) -> Result<()>;

    /// Load a queue descriptor by name
    async fn get_queue_descriptor(&self, name: &str) -> Result<Option<QueueDescriptor>>;

    /// Create a pipe descriptor with the given status and push start time
    async fn create_pipe_descriptor(
        &self,
        queue_name: &str,
        pipe_id: &PipeId,
        status: PipeStatus,
        push_start_timestamp: i64,
    ) -> Result<PipeDescriptor>;

    /// Load a pipe descriptor
    async fn get_pipe_descriptor(
        &self,
        queue_name: &str,
        pipe_id: &PipeId,
    ) -> Result<Option<PipeDescriptor>>;

    /// Overwrite the persisted status of a pipe
    async fn update_pipe_status(&self, pipe: &PipeDescriptor, status: PipeStatus) -> Result<()>;

    /// Append a message to the pipe's waiting list and bump its push count
    ///
    /// # Errors
    /// `AppError::InvalidState` if the persisted pipe no longer accepts pushes
    async fn insert_message(
        &self,
        pipe: &PipeDescriptor,
        msg_id: &MsgId,
        payload: &[u8],
    ) -> Result<QueueMessage>;

    /// Pipes not yet FINISHED_AND_EMPTY, oldest (lowest pipe id) first
    async fn get_oldest_non_empty_pipes(
        &self,
        queue_name: &str,
        limit: usize,
    ) -> Result<Vec<PipeDescriptor>>;

    /// Oldest message in the waiting list
    async fn get_oldest_waiting_message(&self, pipe: &PipeDescriptor)
        -> Result<Option<QueueMessage>>;

    /// Oldest message in the delivered list (inspection)
    async fn get_oldest_delivered_message(
        &self,
        pipe: &PipeDescriptor,
    ) -> Result<Option<QueueMessage>>;

    /// Waiting messages, oldest first (diagnostics)
    async fn list_waiting_messages(
        &self,
        pipe: &PipeDescriptor,
        limit: usize,
    ) -> Result<Vec<QueueMessage>>;

    /// Delivered messages, oldest first (diagnostics)
    async fn list_delivered_messages(
        &self,
        pipe: &PipeDescriptor,
        limit: usize,
    ) -> Result<Vec<QueueMessage>>;

    /// Move a message from waiting to delivered
    ///
    /// # Returns
    /// `false` if the message was no longer waiting (reserved by someone else)
    async fn move_waiting_to_delivered(&self, msg: &QueueMessage) -> Result<bool>;

    /// Delete a delivered message (commit)
    async fn delete_delivered_message(&self, msg: &QueueMessage) -> Result<()>;

    /// Delete a delivered message and re-insert its payload as a new waiting
    /// message in `target` (rollback). Bumps the target's push count.
    ///
    /// # Errors
    /// - `AppError::NotFound` if `msg` is not in its pipe's delivered list
    /// - `AppError::InvalidState` if `target` no longer accepts pushes
    ///
    /// Nothing is written on error.
    async fn delete_and_reinsert_as_waiting(
        &self,
        msg: &QueueMessage,
        target: &PipeDescriptor,
        new_msg_id: &MsgId,
    ) -> Result<QueueMessage>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard};

    #[derive(Default)]
    struct PipeLists {
        waiting: BTreeMap<MsgId, Vec<u8>>,
        delivered: BTreeMap<MsgId, Vec<u8>>,
    }

    #[derive(Default)]
    struct State {
        queues: HashMap<String, QueueDescriptor>,
        // keyed by (queue, pipe id) so iteration is oldest-first per queue
        pipes: BTreeMap<(String, PipeId), PipeDescriptor>,
        messages: HashMap<PipeId, PipeLists>,
    }

    /// In-memory QueueRepository with storage-failure injection
    #[derive(Default)]
    pub struct InMemoryQueueRepository {
        state: Mutex<State>,
        fail_storage: AtomicBool,
    }

    impl InMemoryQueueRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent call fail with `AppError::Storage`
        pub fn set_failing(&self, failing: bool) {
            self.fail_storage.store(failing, Ordering::SeqCst);
        }

        fn state(&self) -> Result<MutexGuard<'_, State>> {
            if self.fail_storage.load(Ordering::SeqCst) {
                return Err(AppError::Storage("injected storage failure".to_string()));
            }
            self.state
                .lock()
                .map_err(|_| AppError::Internal("in-memory store poisoned".to_string()))
        }

        fn bump_push_count(stored: &mut PipeDescriptor) -> Result<()> {
            if !stored.status.is_push_accepting() {
                return Err(AppError::InvalidState(format!(
                    "pipe {} is {}, not accepting pushes",
                    stored.pipe_id, stored.status
                )));
            }
            stored.push_count += 1;
            Ok(())
        }

        fn to_messages(
            pipe_id: &PipeId,
            list: &BTreeMap<MsgId, Vec<u8>>,
            limit: usize,
        ) -> Vec<QueueMessage> {
            list.iter()
                .take(limit)
                .map(|(id, payload)| QueueMessage::new(id.clone(), pipe_id.clone(), payload.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl QueueRepository for InMemoryQueueRepository {
        async fn create_queue_descriptor(&self, desc: &QueueDescriptor) -> Result<()> {
            self.state()?.queues.insert(desc.name.clone(), desc.clone());
            Ok(())
        }

        async fn get_queue_descriptor(&self, name: &str) -> Result<Option<QueueDescriptor>> {
            Ok(self.state()?.queues.get(name).cloned())
        }

        async fn create_pipe_descriptor(
            &self,
            queue_name: &str,
            pipe_id: &PipeId,
            status: PipeStatus,
            push_start_timestamp: i64,
        ) -> Result<PipeDescriptor> {
            let mut state = self.state()?;
            let mut pipe = PipeDescriptor::new(pipe_id.clone(), queue_name, push_start_timestamp);
            pipe.status = status;
            state
                .pipes
                .insert((queue_name.to_string(), pipe_id.clone()), pipe.clone());
            state.messages.entry(pipe_id.clone()).or_default();
            Ok(pipe)
        }

        async fn get_pipe_descriptor(
            &self,
            queue_name: &str,
            pipe_id: &PipeId,
        ) -> Result<Option<PipeDescriptor>> {
            Ok(self
                .state()?
                .pipes
                .get(&(queue_name.to_string(), pipe_id.clone()))
                .cloned())
        }

        async fn update_pipe_status(&self, pipe: &PipeDescriptor, status: PipeStatus) -> Result<()> {
            let mut state = self.state()?;
            match state
                .pipes
                .get_mut(&(pipe.queue_name.clone(), pipe.pipe_id.clone()))
            {
                Some(stored) => {
                    stored.status = status;
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("pipe {}", pipe.pipe_id))),
            }
        }

        async fn insert_message(
            &self,
            pipe: &PipeDescriptor,
            msg_id: &MsgId,
            payload: &[u8],
        ) -> Result<QueueMessage> {
            let mut state = self.state()?;
            let stored = state
                .pipes
                .get_mut(&(pipe.queue_name.clone(), pipe.pipe_id.clone()))
                .ok_or_else(|| AppError::NotFound(format!("pipe {}", pipe.pipe_id)))?;
            Self::bump_push_count(stored)?;
            state
                .messages
                .entry(pipe.pipe_id.clone())
                .or_default()
                .waiting
                .insert(msg_id.clone(), payload.to_vec());
            Ok(QueueMessage::new(
                msg_id.clone(),
                pipe.pipe_id.clone(),
                payload.to_vec(),
            ))
        }

        async fn get_oldest_non_empty_pipes(
            &self,
            queue_name: &str,
            limit: usize,
        ) -> Result<Vec<PipeDescriptor>> {
            let state = self.state()?;
            Ok(state
                .pipes
                .values()
                .filter(|p| p.queue_name == queue_name && !p.status.is_terminal())
                .take(limit)
                .cloned()
                .collect())
        }

        async fn get_oldest_waiting_message(
            &self,
            pipe: &PipeDescriptor,
        ) -> Result<Option<QueueMessage>> {
            let state = self.state()?;
            Ok(state
                .messages
                .get(&pipe.pipe_id)
                .and_then(|l| Self::to_messages(&pipe.pipe_id, &l.waiting, 1).pop()))
        }

        async fn get_oldest_delivered_message(
            &self,
            pipe: &PipeDescriptor,
        ) -> Result<Option<QueueMessage>> {
            let state = self.state()?;
            Ok(state
                .messages
                .get(&pipe.pipe_id)
                .and_then(|l| Self::to_messages(&pipe.pipe_id, &l.delivered, 1).pop()))
        }

        async fn list_waiting_messages(
            &self,
            pipe: &PipeDescriptor,
            limit: usize,
        ) -> Result<Vec<QueueMessage>> {
            let state = self.state()?;
            Ok(state
                .messages
                .get(&pipe.pipe_id)
                .map(|l| Self::to_messages(&pipe.pipe_id, &l.waiting, limit))
                .unwrap_or_default())
        }

        async fn list_delivered_messages(
            &self,
            pipe: &PipeDescriptor,
            limit: usize,
        ) -> Result<Vec<QueueMessage>> {
            let state = self.state()?;
            Ok(state
                .messages
                .get(&pipe.pipe_id)
                .map(|l| Self::to_messages(&pipe.pipe_id, &l.delivered, limit))
                .unwrap_or_default())
        }

        async fn move_waiting_to_delivered(&self, msg: &QueueMessage) -> Result<bool> {
            let mut state = self.state()?;
            let Some(lists) = state.messages.get_mut(&msg.pipe_id) else {
                return Ok(false);
            };
            match lists.waiting.remove(&msg.msg_id) {
                Some(payload) => {
                    lists.delivered.insert(msg.msg_id.clone(), payload);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete_delivered_message(&self, msg: &QueueMessage) -> Result<()> {
            let mut state = self.state()?;
            if let Some(lists) = state.messages.get_mut(&msg.pipe_id) {
                lists.delivered.remove(&msg.msg_id);
            }
            Ok(())
        }

        async fn delete_and_reinsert_as_waiting(
            &self,
            msg: &QueueMessage,
            target: &PipeDescriptor,
            new_msg_id: &MsgId,
        ) -> Result<QueueMessage> {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let stored = state
                .pipes
                .get_mut(&(target.queue_name.clone(), target.pipe_id.clone()))
                .ok_or_else(|| AppError::NotFound(format!("pipe {}", target.pipe_id)))?;
            let delivered = state
                .messages
                .get(&msg.pipe_id)
                .is_some_and(|lists| lists.delivered.contains_key(&msg.msg_id));
            if !delivered {
                return Err(AppError::NotFound(format!(
                    "delivered message {}",
                    msg.msg_id
                )));
            }
            Self::bump_push_count(stored)?;
            if let Some(lists) = state.messages.get_mut(&msg.pipe_id) {
                lists.delivered.remove(&msg.msg_id);
            }
            state
                .messages
                .entry(target.pipe_id.clone())
                .or_default()
                .waiting
                .insert(new_msg_id.clone(), msg.payload.clone());
            Ok(QueueMessage::new(
                new_msg_id.clone(),
                target.pipe_id.clone(),
                msg.payload.clone(),
            ))
        }
    }
}
