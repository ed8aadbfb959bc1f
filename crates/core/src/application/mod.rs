// Application Layer - Queue protocol (pushers, poppers, pipe lifecycle)

pub mod constants;
pub mod pipe_locker;
pub mod popper;
pub mod pusher;
pub mod queue;
pub mod stats;

// Re-exports
pub use pipe_locker::{PipeLockGuard, PipeLocker};
pub use popper::Popper;
pub use pusher::{Pusher, PusherShutdown};
pub use queue::PipeQueue;
pub use stats::{RollingStat, StatSnapshot};
