// Pusher - single writer appending messages to the queue's current pipe
//
// One Pusher drives one logical writer. `push` takes `&mut self` and the type
// is not `Clone`, so a single instance can never be driven by two tasks at
// once; provision one Pusher per task. The current pipe is owned state of the
// instance, not process-wide state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::application::constants::{DRAIN_POLL_INTERVAL, MAX_PIPE_SWITCHES_PER_PUSH};
use crate::application::queue::QueueContext;
use crate::domain::{PipeDescriptor, PipeStatus, QueueMessage};
use crate::error::{AppError, Result};

/// Why the current pipe has to be replaced before the next push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollReason {
    NoPipe,
    Expired,
    Full,
    /// Requeue target would be the message's own pipe
    SamePipe,
}

/// What a push writes into the current pipe
#[derive(Clone, Copy)]
enum PushKind<'a> {
    Fresh(&'a [u8]),
    Requeue(&'a QueueMessage),
}

/// State visible to the shutdown handle
#[derive(Default)]
struct PusherShared {
    shutdown: AtomicBool,
    in_flight: AtomicBool,
    current_pipe: Mutex<Option<PipeDescriptor>>,
}

impl PusherShared {
    fn current_pipe(&self) -> Option<PipeDescriptor> {
        self.current_pipe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_pipe(&self, pipe: &PipeDescriptor) {
        *self
            .current_pipe
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pipe.clone());
    }
}

/// Marks a push as in flight until dropped, including on cancellation
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Pusher {
    ctx: Arc<QueueContext>,
    pipe: Option<PipeDescriptor>,
    push_count: i64,
    shared: Arc<PusherShared>,
}

impl Pusher {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        Self {
            ctx,
            pipe: None,
            push_count: 0,
            shared: Arc::new(PusherShared::default()),
        }
    }

    /// Append `payload` to the queue
    ///
    /// # Errors
    /// - `AppError::InvalidState` once shutdown has been requested
    /// - storage failures from the repository, unretried
    pub async fn push(&mut self, payload: impl AsRef<[u8]>) -> Result<QueueMessage> {
        self.push_internal(PushKind::Fresh(payload.as_ref())).await
    }

    /// Move a delivered message into the current pipe under a new id.
    /// Never reuses the message's own pipe.
    pub(crate) async fn requeue(&mut self, msg: &QueueMessage) -> Result<QueueMessage> {
        self.push_internal(PushKind::Requeue(msg)).await
    }

    async fn push_internal(&mut self, kind: PushKind<'_>) -> Result<QueueMessage> {
        // flag first, then check shutdown: the drain loop must never miss us
        let shared = Arc::clone(&self.shared);
        let _in_flight = InFlight::enter(&shared.in_flight);

        if shared.shutdown.load(Ordering::SeqCst) {
            return Err(AppError::InvalidState(
                "cannot push messages when shutdown in progress".to_string(),
            ));
        }

        let start = Instant::now();
        let avoid = match &kind {
            PushKind::Requeue(msg) => Some(msg.pipe_id.clone()),
            PushKind::Fresh(_) => None,
        };

        for _ in 0..MAX_PIPE_SWITCHES_PER_PUSH {
            self.ensure_pipe(avoid.as_deref()).await?;
            let pipe_id = self.current_pipe_id()?;

            // Hold the pipe lock across the insert so a popper cannot close the
            // pipe between our checks and the write.
            let guard = self.ctx.locker.lock(&pipe_id).await;
            if self.roll_reason(self.ctx.now_millis(), avoid.as_deref()).is_some() {
                debug!(pipe_id = %pipe_id, "pipe went stale while waiting for its lock");
                continue;
            }

            // The local copy only tracks our own pushes. An operator may have
            // finished the pipe and a popper may have closed it since.
            let persisted = self
                .ctx
                .repo
                .get_pipe_descriptor(self.ctx.name(), &pipe_id)
                .await?;
            if !persisted.is_some_and(|p| p.status.is_push_accepting()) {
                debug!(pipe_id = %pipe_id, "pipe no longer accepts pushes");
                self.pipe = None;
                continue;
            }

            let pipe = self
                .pipe
                .as_mut()
                .ok_or_else(|| AppError::Internal("pusher has no current pipe".to_string()))?;
            let msg_id = self.ctx.id_provider.generate_id();
            let inserted = match kind {
                PushKind::Fresh(payload) => self.ctx.repo.insert_message(pipe, &msg_id, payload).await,
                PushKind::Requeue(old) => {
                    self.ctx
                        .repo
                        .delete_and_reinsert_as_waiting(old, pipe, &msg_id)
                        .await
                }
            };
            let msg = match inserted {
                Ok(msg) => msg,
                Err(AppError::InvalidState(reason)) => {
                    // status was changed without taking the pipe lock
                    debug!(pipe_id = %pipe_id, reason = %reason, "store rejected push");
                    self.pipe = None;
                    continue;
                }
                Err(e) => return Err(e),
            };
            pipe.push_count += 1;
            self.push_count += 1;
            drop(guard);

            debug!(msg_id = %msg.msg_id, pipe_id = %msg.pipe_id, "pushed message");
            self.ctx
                .push_stat
                .add_sample(self.ctx.now_millis(), start.elapsed().as_millis() as i64);
            return Ok(msg);
        }

        warn!(queue = %self.ctx.name(), "gave up looking for a push-accepting pipe");
        Err(AppError::InvalidState(format!(
            "no push-accepting pipe after {} switches",
            MAX_PIPE_SWITCHES_PER_PUSH
        )))
    }

    fn current_pipe_id(&self) -> Result<String> {
        self.pipe
            .as_ref()
            .map(|p| p.pipe_id.clone())
            .ok_or_else(|| AppError::Internal("pusher has no current pipe".to_string()))
    }

    fn roll_reason(&self, now: i64, avoid: Option<&str>) -> Option<RollReason> {
        let desc = &self.ctx.descriptor;
        let Some(pipe) = &self.pipe else {
            return Some(RollReason::NoPipe);
        };
        if pipe.is_push_expired(now, desc.max_push_time_of_pipe_ms) {
            Some(RollReason::Expired)
        } else if pipe.is_full(desc.max_pushes_per_pipe) {
            Some(RollReason::Full)
        } else if avoid == Some(pipe.pipe_id.as_str()) {
            Some(RollReason::SamePipe)
        } else {
            None
        }
    }

    /// Replace the current pipe if it can no longer take this push
    async fn ensure_pipe(&mut self, avoid: Option<&str>) -> Result<()> {
        let Some(reason) = self.roll_reason(self.ctx.now_millis(), avoid) else {
            return Ok(());
        };
        debug!(queue = %self.ctx.name(), reason = ?reason, "new pipe needed");

        // keep the old pipe until it is retired, so a failed write is retried
        if let Some(old) = &self.pipe {
            mark_not_active(&self.ctx, old).await?;
        }
        self.pipe = None;

        let pipe_id = self.ctx.id_provider.generate_id();
        let pipe = self
            .ctx
            .repo
            .create_pipe_descriptor(
                self.ctx.name(),
                &pipe_id,
                PipeStatus::PushActive,
                self.ctx.now_millis(),
            )
            .await?;
        info!(queue = %self.ctx.name(), pipe_id = %pipe.pipe_id, "switched to new pipe");

        self.shared.set_current_pipe(&pipe);
        self.pipe = Some(pipe);
        Ok(())
    }

    /// Stop accepting pushes, wait for any in-flight push, then retire the
    /// current pipe
    pub async fn shutdown_and_wait(&mut self) -> Result<()> {
        self.shutdown_handle().shutdown_and_wait().await
    }

    /// Cloneable handle for requesting shutdown from another task
    pub fn shutdown_handle(&self) -> PusherShutdown {
        PusherShutdown {
            ctx: Arc::clone(&self.ctx),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Messages pushed by this instance
    pub fn push_count(&self) -> i64 {
        self.push_count
    }

    pub fn current_pipe(&self) -> Option<&PipeDescriptor> {
        self.pipe.as_ref()
    }

    pub fn queue_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn max_pushes_per_pipe(&self) -> i64 {
        self.ctx.descriptor.max_pushes_per_pipe
    }

    pub fn max_push_time_of_pipe_ms(&self) -> i64 {
        self.ctx.descriptor.max_push_time_of_pipe_ms
    }
}

/// Shutdown handle for a [`Pusher`]
#[derive(Clone)]
pub struct PusherShutdown {
    ctx: Arc<QueueContext>,
    shared: Arc<PusherShared>,
}

impl PusherShutdown {
    /// Reject new pushes immediately, poll until the in-flight push (if any)
    /// finishes, then mark the pusher's pipe NOT_ACTIVE.
    ///
    /// Cancellable: dropping the future stops the wait (pushes stay rejected).
    pub async fn shutdown_and_wait(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        while self.shared.in_flight.load(Ordering::SeqCst) {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if let Some(pipe) = self.shared.current_pipe() {
            mark_not_active(&self.ctx, &pipe).await?;
        }
        info!(queue = %self.ctx.name(), "pusher shut down");
        Ok(())
    }

    /// Like [`shutdown_and_wait`](Self::shutdown_and_wait) with an upper bound on the drain
    pub async fn shutdown_and_wait_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.shutdown_and_wait())
            .await
            .map_err(|_| {
                AppError::InvalidState(format!("push still in flight after {:?}", timeout))
            })?
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

/// Retire a pipe from pushing, unless a popper already moved it further
async fn mark_not_active(ctx: &QueueContext, pipe: &PipeDescriptor) -> Result<()> {
    let _guard = ctx.locker.lock(&pipe.pipe_id).await;
    match ctx
        .repo
        .get_pipe_descriptor(&pipe.queue_name, &pipe.pipe_id)
        .await?
    {
        Some(current) if current.status.can_transition_to(PipeStatus::NotActive) => {
            ctx.repo
                .update_pipe_status(&current, PipeStatus::NotActive)
                .await?;
            debug!(pipe_id = %pipe.pipe_id, "pipe marked NOT_ACTIVE");
        }
        Some(current) => {
            debug!(pipe_id = %pipe.pipe_id, status = %current.status, "pipe already retired");
        }
        None => {
            warn!(pipe_id = %pipe.pipe_id, "pipe descriptor vanished before retirement");
        }
    }
    Ok(())
}
