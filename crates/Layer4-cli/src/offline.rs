//! Offline executor
//!
//! CLI는 agent transport를 갖지 않는다. 로컬 snapshot 평가만 가능하고,
//! 원격 호출은 모두 transport 에러로 끝난다.

use async_trait::async_trait;
use dbguard_foundation::{EncodedCommand, Error, RemoteExecutor, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAgent;

impl OfflineAgent {
    fn unavailable(agent: &str) -> Error {
        Error::Transport(format!("agent {} is not reachable in offline mode", agent))
    }
}

#[async_trait]
impl RemoteExecutor for OfflineAgent {
    async fn execute(&self, agent: &str, _command: &EncodedCommand) -> Result<String> {
        Err(Self::unavailable(agent))
    }

    async fn start_background(&self, agent: &str, _command: &EncodedCommand) -> Result<String> {
        Err(Self::unavailable(agent))
    }

    async fn check_status(&self, agent: &str, _remote_task_id: &str) -> Result<String> {
        Err(Self::unavailable(agent))
    }

    async fn fetch_file(&self, agent: &str, _file_name: &str) -> Result<Vec<u8>> {
        Err(Self::unavailable(agent))
    }
}
