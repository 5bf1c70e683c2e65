//! Remote - 원격 agent 명령 경계
//!
//! - `command.rs` - RemoteCommand codec (JSON + hex), 상태 응답
//! - `executor.rs` - RemoteExecutor trait, RemoteClient (timeout + retry)
//! - `retry.rs` - exponential backoff

mod command;
mod executor;
mod retry;

pub use command::{CommandOutput, EncodedCommand, ExecutionOption, RemoteCommand, RemoteStatus};
pub use executor::{RemoteClient, RemoteExecutor};
pub use retry::{with_retry, RetryConfig};
