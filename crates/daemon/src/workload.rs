// Load runner tasks: pushers generate random payloads, poppers pop and commit

use pipeq_core::application::{Popper, Pusher};
use pipeq_core::AppError;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownToken;

/// Sleep after a storage error before retrying (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Totals across all runner tasks
#[derive(Debug, Default)]
pub struct RunCounters {
    pub pushed: AtomicU64,
    pub popped: AtomicU64,
    pub rolled_back: AtomicU64,
    pub errors: AtomicU64,
}

impl RunCounters {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill(&mut payload[..]);
    payload
}

/// Sleep for `duration`; returns false if shutdown arrived first
async fn pause(duration: Duration, shutdown: &mut ShutdownToken) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = shutdown.wait() => false,
    }
}

/// Push random payloads until shutdown, then retire the pusher's pipe
pub async fn run_pusher(
    id: usize,
    mut pusher: Pusher,
    payload_bytes: usize,
    interval: Duration,
    counters: Arc<RunCounters>,
    mut shutdown: ShutdownToken,
) {
    info!(pusher = id, queue = %pusher.queue_name(), "Pusher started");
    loop {
        if shutdown.is_shutdown() {
            break;
        }
        match pusher.push(random_payload(payload_bytes)).await {
            Ok(_) => {
                counters.pushed.fetch_add(1, Ordering::Relaxed);
                if !interval.is_zero() && !pause(interval, &mut shutdown).await {
                    break;
                }
            }
            Err(AppError::InvalidState(_)) => break,
            Err(e) => {
                error!(pusher = id, error = %e, "Push failed");
                counters.errors.fetch_add(1, Ordering::Relaxed);
                if !pause(ERROR_RECOVERY_SLEEP_DURATION, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = pusher.shutdown_and_wait().await {
        error!(pusher = id, error = %e, "Failed to retire pipe on shutdown");
    }
    info!(pusher = id, pushed = pusher.push_count(), "Pusher stopped");
}

/// Pop and commit until shutdown; sleeps `idle` when the queue is empty
pub async fn run_popper(
    id: usize,
    popper: Popper,
    idle: Duration,
    counters: Arc<RunCounters>,
    mut shutdown: ShutdownToken,
) {
    info!(popper = id, "Popper started");
    loop {
        if shutdown.is_shutdown() {
            break;
        }
        match popper.pop().await {
            Ok(Some(msg)) => {
                if let Err(e) = popper.commit(&msg).await {
                    warn!(popper = id, msg_id = %msg.msg_id, error = %e, "Commit failed, rolling back");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    match popper.rollback(&msg).await {
                        Ok(_) => {
                            counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(popper = id, msg_id = %msg.msg_id, error = %e, "Rollback failed");
                        }
                    }
                    continue;
                }
                counters.popped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                if !pause(idle, &mut shutdown).await {
                    break;
                }
            }
            Err(AppError::InvalidState(_)) => break,
            Err(e) => {
                error!(popper = id, error = %e, "Pop failed");
                counters.errors.fetch_add(1, Ordering::Relaxed);
                if !pause(ERROR_RECOVERY_SLEEP_DURATION, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    popper.shutdown();
    info!(popper = id, "Popper stopped");
}
