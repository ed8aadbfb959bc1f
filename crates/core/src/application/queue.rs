// PipeQueue - queue handle and factory for pushers/poppers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::constants::DEFAULT_STAT_WINDOW_MS;
use crate::application::pipe_locker::PipeLocker;
use crate::application::popper::Popper;
use crate::application::pusher::Pusher;
use crate::application::stats::{RollingStat, StatSnapshot};
use crate::domain::QueueDescriptor;
use crate::error::{AppError, Result};
use crate::port::{IdProvider, QueueRepository, TimeProvider};

/// Shared state behind every pusher/popper of one queue
pub(crate) struct QueueContext {
    pub(crate) descriptor: QueueDescriptor,
    pop_width: AtomicUsize,
    pub(crate) repo: Arc<dyn QueueRepository>,
    pub(crate) locker: Arc<PipeLocker>,
    pub(crate) id_provider: Arc<dyn IdProvider>,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) push_stat: RollingStat,
    pub(crate) pop_stat: RollingStat,
}

impl QueueContext {
    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn pop_width(&self) -> usize {
        self.pop_width.load(Ordering::SeqCst)
    }

    pub(crate) fn now_millis(&self) -> i64 {
        self.time_provider.now_millis()
    }
}

/// Handle to one queue
///
/// Cheap to clone; all clones share configuration, statistics and the
/// pipe locker.
#[derive(Clone)]
pub struct PipeQueue {
    ctx: Arc<QueueContext>,
}

impl PipeQueue {
    /// Open a queue, creating its persisted descriptor on first use
    ///
    /// When a descriptor already exists the persisted values win over
    /// `settings`; queue configuration is created once.
    ///
    /// # Example
    /// ```ignore
    /// let queue = PipeQueue::open(
    ///     repo,
    ///     Arc::new(PipeLocker::new()),
    ///     Arc::new(TimeOrderedIdProvider),
    ///     Arc::new(SystemTimeProvider),
    ///     QueueDescriptor::new("orders", 20_000, 5_000, 4, 500),
    /// )
    /// .await?;
    /// ```
    pub async fn open(
        repo: Arc<dyn QueueRepository>,
        locker: Arc<PipeLocker>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        settings: QueueDescriptor,
    ) -> Result<Self> {
        settings.validate()?;

        let descriptor = match repo.get_queue_descriptor(&settings.name).await? {
            Some(existing) => {
                if existing != settings {
                    warn!(
                        queue = %settings.name,
                        "Queue already exists with different settings, using persisted descriptor"
                    );
                }
                existing
            }
            None => {
                repo.create_queue_descriptor(&settings).await?;
                info!(queue = %settings.name, "Created queue descriptor");
                settings
            }
        };

        Ok(Self::from_descriptor(
            descriptor,
            repo,
            locker,
            id_provider,
            time_provider,
        ))
    }

    /// Open a queue, overwriting any persisted descriptor with `settings`
    pub async fn open_replacing(
        repo: Arc<dyn QueueRepository>,
        locker: Arc<PipeLocker>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        settings: QueueDescriptor,
    ) -> Result<Self> {
        settings.validate()?;
        repo.create_queue_descriptor(&settings).await?;
        info!(queue = %settings.name, "Replaced queue descriptor");

        Ok(Self::from_descriptor(
            settings,
            repo,
            locker,
            id_provider,
            time_provider,
        ))
    }

    fn from_descriptor(
        descriptor: QueueDescriptor,
        repo: Arc<dyn QueueRepository>,
        locker: Arc<PipeLocker>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let pop_width = AtomicUsize::new(descriptor.max_pop_width as usize);
        Self {
            ctx: Arc::new(QueueContext {
                descriptor,
                pop_width,
                repo,
                locker,
                id_provider,
                time_provider,
                push_stat: RollingStat::new(DEFAULT_STAT_WINDOW_MS),
                pop_stat: RollingStat::new(DEFAULT_STAT_WINDOW_MS),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.ctx.descriptor
    }

    pub fn pop_width(&self) -> usize {
        self.ctx.pop_width()
    }

    /// Adjust how many pipes poppers consider; applied at their next refresh
    pub fn set_pop_width(&self, width: usize) -> Result<()> {
        let max = self.ctx.descriptor.max_pop_width as usize;
        if width == 0 || width > max {
            return Err(AppError::Validation(format!(
                "pop width must be within 1..={}, got {}",
                max, width
            )));
        }
        self.ctx.pop_width.store(width, Ordering::SeqCst);
        info!(queue = %self.name(), pop_width = width, "Pop width changed");
        Ok(())
    }

    /// New single-writer pusher; provision one per task
    pub fn create_pusher(&self) -> Pusher {
        Pusher::new(Arc::clone(&self.ctx))
    }

    pub fn create_popper(&self) -> Popper {
        Popper::new(Arc::clone(&self.ctx))
    }

    /// Push latency (ms) over the stat window
    pub fn push_stats(&self) -> StatSnapshot {
        self.ctx.push_stat.snapshot(self.ctx.now_millis())
    }

    /// Pop latency (ms) over the stat window
    pub fn pop_stats(&self) -> StatSnapshot {
        self.ctx.pop_stat.snapshot(self.ctx.now_millis())
    }
}
