// Queue protocol constants (No magic values)
use std::time::Duration;

/// Poll interval while `shutdown_and_wait` waits for an in-flight push (100ms)
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Window over which push/pop latency samples are aggregated (1 minute)
pub const DEFAULT_STAT_WINDOW_MS: i64 = 60 * 1000;

/// Upper bound on samples kept per rolling stat
pub const STAT_MAX_SAMPLES: usize = 10_000;

/// Default push window of a pipe (20 seconds)
pub const DEFAULT_MAX_PUSH_TIME_OF_PIPE_MS: i64 = 20 * 1000;

/// Default pipe capacity
pub const DEFAULT_MAX_PUSHES_PER_PIPE: i64 = 5_000;

/// Default number of pipes a popper drains concurrently
pub const DEFAULT_MAX_POP_WIDTH: i64 = 4;

/// Default minimum interval between pop window refreshes (500ms)
pub const DEFAULT_POP_PIPE_REFRESH_DELAY_MS: i64 = 500;

/// Pipe switches a single push may make before giving up. A fresh pipe is
/// only lost to a concurrent close, so more than one switch is rare.
pub const MAX_PIPE_SWITCHES_PER_PUSH: usize = 3;
