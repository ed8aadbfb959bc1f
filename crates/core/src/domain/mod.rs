// Domain Layer - Pipes, messages and queue configuration

pub mod error;
pub mod message;
pub mod pipe;
pub mod queue;

// Re-exports
pub use error::DomainError;
pub use message::{MsgId, QueueMessage};
pub use pipe::{PipeDescriptor, PipeId, PipeStatus};
pub use queue::{QueueDescriptor, QueueName};
