// Runner configuration (environment variables)

use anyhow::{anyhow, Context, Result};
use pipeq_core::application::constants::{
    DEFAULT_MAX_POP_WIDTH, DEFAULT_MAX_PUSHES_PER_PIPE, DEFAULT_MAX_PUSH_TIME_OF_PIPE_MS,
    DEFAULT_POP_PIPE_REFRESH_DELAY_MS,
};
use pipeq_core::domain::QueueDescriptor;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "~/.pipeq/queue.db";
const DEFAULT_QUEUE: &str = "default";
const DEFAULT_PUSHERS: usize = 1;
const DEFAULT_POPPERS: usize = 2;
const DEFAULT_PAYLOAD_BYTES: usize = 256;
const DEFAULT_PUSH_INTERVAL_MS: u64 = 10;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub db_path: String,
    pub queue: QueueDescriptor,
    pub pushers: usize,
    pub poppers: usize,
    pub payload_bytes: usize,
    pub push_interval: Duration,
    pub stats_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = lookup("PIPEQ_DB_PATH")
            .unwrap_or_else(|| shellexpand::tilde(DEFAULT_DB_PATH).into_owned());
        let queue_name = lookup("PIPEQ_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        let queue = QueueDescriptor::new(
            queue_name,
            parse_or(&lookup, "PIPEQ_MAX_PUSH_TIME_MS", DEFAULT_MAX_PUSH_TIME_OF_PIPE_MS)?,
            parse_or(&lookup, "PIPEQ_MAX_PUSHES_PER_PIPE", DEFAULT_MAX_PUSHES_PER_PIPE)?,
            parse_or(&lookup, "PIPEQ_MAX_POP_WIDTH", DEFAULT_MAX_POP_WIDTH)?,
            parse_or(
                &lookup,
                "PIPEQ_POP_REFRESH_DELAY_MS",
                DEFAULT_POP_PIPE_REFRESH_DELAY_MS,
            )?,
        );
        queue
            .validate()
            .map_err(|e| anyhow!("Invalid queue settings: {}", e))?;

        Ok(Self {
            db_path,
            queue,
            pushers: parse_or(&lookup, "PIPEQ_PUSHERS", DEFAULT_PUSHERS)?,
            poppers: parse_or(&lookup, "PIPEQ_POPPERS", DEFAULT_POPPERS)?,
            payload_bytes: parse_or(&lookup, "PIPEQ_PAYLOAD_BYTES", DEFAULT_PAYLOAD_BYTES)?,
            push_interval: Duration::from_millis(parse_or(
                &lookup,
                "PIPEQ_PUSH_INTERVAL_MS",
                DEFAULT_PUSH_INTERVAL_MS,
            )?),
            stats_interval: Duration::from_secs(parse_or(
                &lookup,
                "PIPEQ_STATS_INTERVAL_SECS",
                DEFAULT_STATS_INTERVAL_SECS,
            )?)
            .max(Duration::from_secs(1)),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}
