// Popper - reserves messages from a bounded window of the oldest pipes
//
// Each popper keeps its own window of up to `pop_width` pipes, refreshed at
// most once per `pop_pipe_refresh_delay_ms`. Pops rotate round-robin through
// the window so its pipes drain in parallel. Poppers are also where pipes are
// declared FINISHED_AND_EMPTY: only a popper observes "no waiting messages"
// and "no longer accepting pushes" together, which also covers pipes whose
// pusher died before retiring them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::pusher::Pusher;
use crate::application::queue::QueueContext;
use crate::domain::{PipeDescriptor, PipeStatus, QueueMessage};
use crate::error::{AppError, Result};

/// Client-side view of the oldest pipes
#[derive(Default)]
struct PipeWindow {
    pipes: Vec<PipeDescriptor>,
    cursor: usize,
    last_refresh: Option<i64>,
}

impl PipeWindow {
    fn is_stale(&self, now: i64, refresh_delay_ms: i64) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => now - at >= refresh_delay_ms,
        }
    }
}

/// Outcome of checking an empty pipe for closure
enum PipeCheck {
    /// Pipe is FINISHED_AND_EMPTY (now or already); drop it from the window
    Finished,
    /// Pipe stays open; carries its freshly read descriptor
    Open(PipeDescriptor),
}

pub struct Popper {
    ctx: Arc<QueueContext>,
    window: Mutex<PipeWindow>,
    rollback_pusher: Mutex<Pusher>,
    shutdown: AtomicBool,
}

impl Popper {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        let rollback_pusher = Pusher::new(Arc::clone(&ctx));
        Self {
            ctx,
            window: Mutex::new(PipeWindow::default()),
            rollback_pusher: Mutex::new(rollback_pusher),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Reserve the next message, moving it from waiting to delivered
    ///
    /// # Returns
    /// `None` when no message is currently available; this is not an error.
    ///
    /// # Errors
    /// - `AppError::InvalidState` after [`shutdown`](Self::shutdown)
    /// - storage failures from the repository, unretried
    pub async fn pop(&self) -> Result<Option<QueueMessage>> {
        if self.is_shutdown() {
            return Err(AppError::InvalidState(
                "cannot pop messages when shutdown in progress".to_string(),
            ));
        }

        let start = Instant::now();
        let mut window = self.window.lock().await;
        if window.is_stale(
            self.ctx.now_millis(),
            self.ctx.descriptor.pop_pipe_refresh_delay_ms,
        ) {
            self.refresh(&mut window).await?;
        }

        let mut refreshed_after_close = false;
        loop {
            let mut closed_any = false;
            let mut tried = 0;

            while tried < window.pipes.len() {
                let idx = window.cursor % window.pipes.len();
                let pipe = window.pipes[idx].clone();

                if let Some(msg) = self.reserve_oldest(&pipe).await? {
                    window.cursor = idx + 1;
                    self.ctx
                        .pop_stat
                        .add_sample(self.ctx.now_millis(), start.elapsed().as_millis() as i64);
                    return Ok(Some(msg));
                }

                match self.check_empty_pipe(&pipe).await? {
                    PipeCheck::Finished => {
                        window.pipes.remove(idx);
                        window.cursor = idx;
                        closed_any = true;
                    }
                    PipeCheck::Open(fresh) => {
                        window.pipes[idx] = fresh;
                        window.cursor = idx + 1;
                        tried += 1;
                    }
                }
            }

            // Closing pipes freed room in the window: roll onto the next ones now
            // instead of waiting out the refresh delay.
            if closed_any && !refreshed_after_close {
                refreshed_after_close = true;
                self.refresh(&mut window).await?;
                continue;
            }
            return Ok(None);
        }
    }

    /// Drop the cached window and reload it, ignoring the refresh delay
    pub async fn force_refresh(&self) -> Result<()> {
        let mut window = self.window.lock().await;
        self.refresh(&mut window).await
    }

    /// Acknowledge a delivered message, deleting it permanently.
    /// Commit each message once; the store does not deduplicate.
    pub async fn commit(&self, msg: &QueueMessage) -> Result<()> {
        self.ctx.repo.delete_delivered_message(msg).await?;
        debug!(msg_id = %msg.msg_id, pipe_id = %msg.pipe_id, "committed message");
        Ok(())
    }

    /// Requeue a delivered message at the tail of the queue under a new id
    ///
    /// The payload lands in a push-active pipe other than its original one,
    /// so ordering relative to other messages is not preserved.
    pub async fn rollback(&self, msg: &QueueMessage) -> Result<QueueMessage> {
        let mut pusher = self.rollback_pusher.lock().await;
        let requeued = pusher.requeue(msg).await?;
        debug!(
            old_msg_id = %msg.msg_id,
            new_msg_id = %requeued.msg_id,
            pipe_id = %requeued.pipe_id,
            "rolled back message"
        );
        Ok(requeued)
    }

    /// Reject further pops. Delivered, uncommitted messages are untouched.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!(queue = %self.ctx.name(), "popper shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Snapshot of the pipes currently in this popper's window
    pub async fn window_pipes(&self) -> Vec<PipeDescriptor> {
        self.window.lock().await.pipes.clone()
    }

    async fn refresh(&self, window: &mut PipeWindow) -> Result<()> {
        let width = self.ctx.pop_width();
        window.pipes = self
            .ctx
            .repo
            .get_oldest_non_empty_pipes(self.ctx.name(), width)
            .await?;
        window.cursor = 0;
        window.last_refresh = Some(self.ctx.now_millis());
        debug!(
            queue = %self.ctx.name(),
            width = width,
            pipes = window.pipes.len(),
            "refreshed pop window"
        );
        Ok(())
    }

    /// Take the oldest waiting message; retry if another popper beat us to it
    async fn reserve_oldest(&self, pipe: &PipeDescriptor) -> Result<Option<QueueMessage>> {
        loop {
            let Some(msg) = self.ctx.repo.get_oldest_waiting_message(pipe).await? else {
                return Ok(None);
            };
            if self.ctx.repo.move_waiting_to_delivered(&msg).await? {
                debug!(msg_id = %msg.msg_id, pipe_id = %msg.pipe_id, "reserved message");
                return Ok(Some(msg));
            }
            debug!(msg_id = %msg.msg_id, "message reserved by another popper, retrying");
        }
    }

    /// Close `pipe` if it has no waiting messages and no longer takes pushes
    /// (retired, push-finished, or past its push window)
    async fn check_empty_pipe(&self, pipe: &PipeDescriptor) -> Result<PipeCheck> {
        let _guard = self.ctx.locker.lock(&pipe.pipe_id).await;

        let Some(current) = self
            .ctx
            .repo
            .get_pipe_descriptor(&pipe.queue_name, &pipe.pipe_id)
            .await?
        else {
            warn!(pipe_id = %pipe.pipe_id, "pipe descriptor vanished, dropping from window");
            return Ok(PipeCheck::Finished);
        };
        if current.status.is_terminal() {
            return Ok(PipeCheck::Finished);
        }

        let now = self.ctx.now_millis();
        if !current.is_closable(now, self.ctx.descriptor.max_push_time_of_pipe_ms) {
            return Ok(PipeCheck::Open(current));
        }

        // a push may have landed between the empty read and taking the lock
        if self
            .ctx
            .repo
            .get_oldest_waiting_message(&current)
            .await?
            .is_some()
        {
            return Ok(PipeCheck::Open(current));
        }

        self.ctx
            .repo
            .update_pipe_status(&current, PipeStatus::FinishedAndEmpty)
            .await?;
        info!(
            queue = %current.queue_name,
            pipe_id = %current.pipe_id,
            previous_status = %current.status,
            push_count = current.push_count,
            "pipe finished and empty"
        );
        Ok(PipeCheck::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{PipeLocker, PipeQueue};
    use crate::domain::QueueDescriptor;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::queue_repository::mocks::InMemoryQueueRepository;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use crate::port::{IdProvider, QueueRepository, TimeProvider};
    use std::collections::HashSet;

    struct Fixture {
        repo: Arc<InMemoryQueueRepository>,
        clock: Arc<ManualTimeProvider>,
        ids: Arc<SequentialIdProvider>,
        queue: PipeQueue,
    }

    async fn fixture(max_pushes: i64, max_pop_width: i64) -> Fixture {
        let repo = Arc::new(InMemoryQueueRepository::new());
        let clock = Arc::new(ManualTimeProvider::new(100_000));
        let ids = Arc::new(SequentialIdProvider::new());
        let queue = PipeQueue::open(
            repo.clone(),
            Arc::new(PipeLocker::new()),
            ids.clone(),
            clock.clone(),
            QueueDescriptor::new("popper_test", 20_000, max_pushes, max_pop_width, 5_000),
        )
        .await
        .unwrap();
        Fixture {
            repo,
            clock,
            ids,
            queue,
        }
    }

    async fn pipe(repo: &InMemoryQueueRepository, pipe_id: &str) -> PipeDescriptor {
        repo.get_pipe_descriptor("popper_test", &pipe_id.to_string())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_popper_moves_message_to_delivered() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        let pushed = pusher.push("the data").await.unwrap();
        popper.force_refresh().await.unwrap();
        let popped = popper.pop().await.unwrap().unwrap();

        assert_eq!(pushed, popped);
        assert_eq!(pushed.payload(), popped.payload());

        let desc = pipe(&f.repo, &pushed.pipe_id).await;
        assert!(f.repo.get_oldest_waiting_message(&desc).await.unwrap().is_none());
        assert_eq!(
            f.repo.get_oldest_delivered_message(&desc).await.unwrap(),
            Some(pushed)
        );
    }

    #[tokio::test]
    async fn test_no_pipes_returns_none() {
        let f = fixture(10, 1).await;
        let popper = f.queue.create_popper();
        assert!(popper.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multiple_poppers_single_pipe_deliver_in_order() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let poppers = [
            f.queue.create_popper(),
            f.queue.create_popper(),
            f.queue.create_popper(),
        ];

        let mut pushed = Vec::new();
        for i in 0..6 {
            pushed.push(pusher.push(format!("data-{}", i)).await.unwrap());
        }
        for popper in &poppers {
            popper.force_refresh().await.unwrap();
        }

        for (i, expected) in pushed.iter().enumerate() {
            let popped = poppers[i % poppers.len()].pop().await.unwrap().unwrap();
            assert_eq!(&popped, expected);
            assert_eq!(popped.payload(), expected.payload());
        }
    }

    #[tokio::test]
    async fn test_window_rotates_across_pipes() {
        let max_pushes = 5;
        let pop_width = 3;
        let iterations = 3;
        let f = fixture(max_pushes, pop_width).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        let mut pushed = vec![vec![Vec::new(); pop_width as usize]; iterations];
        for (iter, pipes) in pushed.iter_mut().enumerate() {
            for (p, msgs) in pipes.iter_mut().enumerate() {
                for push in 0..max_pushes {
                    let payload = format!("data-{}.{}.{}", iter, p, push);
                    msgs.push(pusher.push(payload).await.unwrap());
                }
            }
        }

        for pipes in &pushed {
            for push in 0..max_pushes as usize {
                for msgs in pipes {
                    let popped = popper.pop().await.unwrap().unwrap();
                    assert_eq!(popped.payload(), msgs[push].payload());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_push_finished_pipe_closes_and_rolls_to_next() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        for i in 0..10 {
            pusher.push(format!("data-{}", i)).await.unwrap();
        }
        pusher.push("over-to-next").await.unwrap();

        let first = f
            .repo
            .get_oldest_non_empty_pipes("popper_test", 1)
            .await
            .unwrap()
            .remove(0);
        f.repo
            .update_pipe_status(&first, PipeStatus::PushFinished)
            .await
            .unwrap();

        for _ in 0..10 {
            popper.pop().await.unwrap().unwrap();
            assert_eq!(
                pipe(&f.repo, &first.pipe_id).await.status,
                PipeStatus::PushFinished
            );
        }

        let next = popper.pop().await.unwrap().unwrap();
        assert_eq!(next.payload_str(), Some("over-to-next"));
        assert_eq!(
            pipe(&f.repo, &first.pipe_id).await.status,
            PipeStatus::FinishedAndEmpty
        );
    }

    #[tokio::test]
    async fn test_expired_pipe_closed_by_pop() {
        let f = fixture(10, 1).await;
        let expired_id = f.ids.generate_id();
        let fresh_id = f.ids.generate_id();
        f.repo
            .create_pipe_descriptor("popper_test", &expired_id, PipeStatus::PushActive, 1)
            .await
            .unwrap();
        f.repo
            .create_pipe_descriptor(
                "popper_test",
                &fresh_id,
                PipeStatus::PushActive,
                f.clock.now_millis(),
            )
            .await
            .unwrap();

        let popper = f.queue.create_popper();
        assert!(popper.pop().await.unwrap().is_none());

        assert_eq!(
            pipe(&f.repo, &expired_id).await.status,
            PipeStatus::FinishedAndEmpty
        );
        assert_eq!(pipe(&f.repo, &fresh_id).await.status, PipeStatus::PushActive);
    }

    #[tokio::test]
    async fn test_active_empty_pipe_stays_open() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        let msg = pusher.push("only").await.unwrap();
        popper.pop().await.unwrap().unwrap();
        assert!(popper.pop().await.unwrap().is_none());
        assert_eq!(
            pipe(&f.repo, &msg.pipe_id).await.status,
            PipeStatus::PushActive
        );

        // once its push window passes, the next pop retires it
        f.clock.advance(20_001);
        assert!(popper.pop().await.unwrap().is_none());
        assert_eq!(
            pipe(&f.repo, &msg.pipe_id).await.status,
            PipeStatus::FinishedAndEmpty
        );
    }

    #[tokio::test]
    async fn test_pop_after_shutdown_is_invalid_state() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();
        for _ in 0..3 {
            pusher.push("blah").await.unwrap();
        }

        popper.force_refresh().await.unwrap();
        let delivered = popper.pop().await.unwrap().unwrap();
        popper.shutdown();

        assert!(matches!(popper.pop().await, Err(AppError::InvalidState(_))));
        // in-flight deliveries can still be finalized
        assert!(popper.commit(&delivered).await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_empties_delivered_list() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        let mut delivered = Vec::new();
        for _ in 0..3 {
            pusher.push("blah").await.unwrap();
            delivered.push(popper.pop().await.unwrap().unwrap());
        }
        let desc = pipe(&f.repo, &delivered[0].pipe_id).await;

        for remaining in (1..=3).rev() {
            assert_eq!(
                f.repo.list_delivered_messages(&desc, 10).await.unwrap().len(),
                remaining
            );
            popper.commit(&delivered.remove(0)).await.unwrap();
        }
        assert!(f.repo.list_delivered_messages(&desc, 10).await.unwrap().is_empty());
        assert!(f.repo.list_waiting_messages(&desc, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_requeues_into_new_pipe() {
        let f = fixture(10, 2).await;
        f.queue.set_pop_width(1).unwrap();
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        let mut delivered = Vec::new();
        for _ in 0..6 {
            pusher.push("blah").await.unwrap();
            delivered.push(popper.pop().await.unwrap().unwrap());
        }
        let source_pipe = delivered[0].pipe_id.clone();

        let mut rolled_back = Vec::new();
        for (i, msg) in delivered.iter().enumerate() {
            if i % 2 == 0 {
                popper.commit(msg).await.unwrap();
            } else {
                let requeued = popper.rollback(msg).await.unwrap();
                assert_ne!(requeued.msg_id, msg.msg_id);
                assert_ne!(requeued.pipe_id, source_pipe);
                assert_eq!(requeued.payload(), msg.payload());
                rolled_back.push(requeued);
            }
        }

        let pipes = f
            .repo
            .get_oldest_non_empty_pipes("popper_test", 12)
            .await
            .unwrap();
        assert_eq!(pipes.len(), 2, "rollbacks opened an extra pipe");
        assert!(f.repo.list_delivered_messages(&pipes[0], 12).await.unwrap().is_empty());
        assert_eq!(
            f.repo.list_waiting_messages(&pipes[1], 12).await.unwrap().len(),
            3
        );
        assert_eq!(pipes[1].status, PipeStatus::PushActive);

        f.queue.set_pop_width(2).unwrap();
        popper.force_refresh().await.unwrap();
        for expected in rolled_back {
            assert_eq!(popper.pop().await.unwrap(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_rollback_of_requeued_message_leaves_its_pipe() {
        let f = fixture(10, 2).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        pusher.push("retry-me").await.unwrap();
        let first = popper.pop().await.unwrap().unwrap();
        let requeued = popper.rollback(&first).await.unwrap();

        popper.force_refresh().await.unwrap();
        let again = popper.pop().await.unwrap().unwrap();
        assert_eq!(again, requeued);

        let requeued_twice = popper.rollback(&again).await.unwrap();
        assert_ne!(requeued_twice.pipe_id, again.pipe_id);
        assert_eq!(
            pipe(&f.repo, &again.pipe_id).await.status,
            PipeStatus::NotActive
        );
    }

    #[tokio::test]
    async fn test_concurrent_poppers_deliver_each_message_once() {
        let f = fixture(7, 3).await;
        let mut pusher = f.queue.create_pusher();
        let total = 60;
        for i in 0..total {
            pusher.push(format!("msg-{}", i)).await.unwrap();
        }
        pusher.shutdown_and_wait().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let popper = f.queue.create_popper();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                let mut idle = 0;
                while idle < 3 {
                    match popper.pop().await.unwrap() {
                        Some(msg) => {
                            popper.commit(&msg).await.unwrap();
                            got.push(msg.payload_str().unwrap().to_string());
                            idle = 0;
                        }
                        None => {
                            idle += 1;
                            popper.force_refresh().await.unwrap();
                        }
                    }
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for payload in handle.await.unwrap() {
                assert!(seen.insert(payload), "message delivered twice");
            }
        }
        assert_eq!(seen.len(), total);
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_from_pop() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();
        pusher.push("a").await.unwrap();

        f.repo.set_failing(true);
        assert!(popper.pop().await.unwrap_err().is_storage());
        f.repo.set_failing(false);
        assert!(popper.pop().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_push_after_pipe_closed_stays_reachable() {
        let f = fixture(10, 1).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        let first = pusher.push("first").await.unwrap();
        let desc = pipe(&f.repo, &first.pipe_id).await;
        f.repo
            .update_pipe_status(&desc, PipeStatus::PushFinished)
            .await
            .unwrap();

        let got = popper.pop().await.unwrap().unwrap();
        popper.commit(&got).await.unwrap();
        assert!(popper.pop().await.unwrap().is_none());
        assert_eq!(
            pipe(&f.repo, &first.pipe_id).await.status,
            PipeStatus::FinishedAndEmpty
        );

        let second = pusher.push("second").await.unwrap();
        assert_ne!(second.pipe_id, first.pipe_id);
        let closed = pipe(&f.repo, &first.pipe_id).await;
        assert_eq!(closed.push_count, 1);

        popper.force_refresh().await.unwrap();
        assert_eq!(popper.pop().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_second_rollback_of_same_message_is_rejected() {
        let f = fixture(10, 2).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        pusher.push("once").await.unwrap();
        let msg = popper.pop().await.unwrap().unwrap();
        let requeued = popper.rollback(&msg).await.unwrap();

        let err = popper.rollback(&msg).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let target = pipe(&f.repo, &requeued.pipe_id).await;
        assert_eq!(
            f.repo.list_waiting_messages(&target, 10).await.unwrap(),
            vec![requeued]
        );
        assert_eq!(target.push_count, 1);
    }

    #[tokio::test]
    async fn test_rollback_after_commit_is_rejected() {
        let f = fixture(10, 2).await;
        let mut pusher = f.queue.create_pusher();
        let popper = f.queue.create_popper();

        pusher.push("done").await.unwrap();
        let msg = popper.pop().await.unwrap().unwrap();
        popper.commit(&msg).await.unwrap();

        assert!(matches!(
            popper.rollback(&msg).await,
            Err(AppError::NotFound(_))
        ));
        popper.force_refresh().await.unwrap();
        assert!(popper.pop().await.unwrap().is_none());
    }
}
