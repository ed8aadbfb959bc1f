//! Shared fixtures for SQLite-backed queue tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pipeq_core::application::{PipeLocker, PipeQueue};
use pipeq_core::domain::QueueDescriptor;
use pipeq_core::port::id_provider::mocks::SequentialIdProvider;
use pipeq_core::port::time_provider::mocks::ManualTimeProvider;
use pipeq_core::port::{IdProvider, TimeProvider};
use pipeq_infra_sqlite::{create_pool, run_migrations, SqliteQueueRepository};
use sqlx::SqlitePool;

pub const QUEUE: &str = "it_queue";
pub const START_MILLIS: i64 = 1_700_000_000_000;

pub struct TestQueue {
    pub repo: Arc<SqliteQueueRepository>,
    pub clock: Arc<ManualTimeProvider>,
    pub ids: Arc<SequentialIdProvider>,
    pub queue: PipeQueue,
}

pub fn descriptor(max_pushes: i64, max_pop_width: i64) -> QueueDescriptor {
    QueueDescriptor::new(QUEUE, 20_000, max_pushes, max_pop_width, 500)
}

pub async fn memory_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

pub async fn file_pool(path: &Path) -> SqlitePool {
    let pool = create_pool(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Queue over `pool` with a manual clock and sequential ids
pub async fn open_queue(pool: SqlitePool, desc: QueueDescriptor) -> TestQueue {
    let repo = Arc::new(SqliteQueueRepository::new(pool));
    let clock = Arc::new(ManualTimeProvider::new(START_MILLIS));
    let ids = Arc::new(SequentialIdProvider::new());
    let queue = open_with(repo.clone(), ids.clone(), clock.clone(), desc).await;
    TestQueue {
        repo,
        clock,
        ids,
        queue,
    }
}

pub async fn open_with(
    repo: Arc<SqliteQueueRepository>,
    ids: Arc<dyn IdProvider>,
    clock: Arc<dyn TimeProvider>,
    desc: QueueDescriptor,
) -> PipeQueue {
    PipeQueue::open(repo, Arc::new(PipeLocker::new()), ids, clock, desc)
        .await
        .unwrap()
}
