//! Remote executor boundary
//!
//! `RemoteExecutor`는 transport 구현 (agent 연결, 인증)을 숨긴다.
//! `RemoteClient`는 호출마다 timeout + retry를 적용한다.

use super::command::{EncodedCommand, ExecutionOption, RemoteCommand, RemoteStatus};
use super::retry::{with_retry, RetryConfig};
use crate::config::RemoteConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Command execution on a remote agent
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command synchronously and return its raw output
    async fn execute(&self, agent: &str, command: &EncodedCommand) -> Result<String>;

    /// Start a background task, returning the remote task id
    async fn start_background(&self, agent: &str, command: &EncodedCommand) -> Result<String>;

    /// Raw JSON status of a background task
    async fn check_status(&self, agent: &str, remote_task_id: &str) -> Result<String>;

    /// Download a result file produced by a background task
    async fn fetch_file(&self, agent: &str, file_name: &str) -> Result<Vec<u8>>;
}

/// Executor wrapper applying per-call timeout and bounded retry
#[derive(Clone)]
pub struct RemoteClient {
    executor: Arc<dyn RemoteExecutor>,
    timeout: Duration,
    retry: RetryConfig,
}

impl RemoteClient {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: &RemoteConfig) -> Self {
        Self {
            executor,
            timeout: config.timeout(),
            retry: RetryConfig::from(config),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn execute(&self, agent: &str, command: &RemoteCommand) -> Result<String> {
        let encoded = command.encode()?;
        debug!(agent, action = %command.action, "Executing remote command");
        self.call("execute", || self.executor.execute(agent, &encoded))
            .await
    }

    pub async fn start_background(&self, agent: &str, command: &RemoteCommand) -> Result<String> {
        let mut command = command.clone();
        command.option = ExecutionOption::Background;
        let encoded = command.encode()?;
        debug!(agent, action = %command.action, "Starting remote background task");
        let task_id = self
            .call("start_background", || {
                self.executor.start_background(agent, &encoded)
            })
            .await?;
        let task_id = task_id.trim().to_string();
        if task_id.is_empty() {
            return Err(Error::Parse(
                "Remote agent returned an empty task id".to_string(),
            ));
        }
        Ok(task_id)
    }

    /// Status check + parse (parse errors are not retried)
    pub async fn check_status(&self, agent: &str, remote_task_id: &str) -> Result<RemoteStatus> {
        let raw = self
            .call("check_status", || {
                self.executor.check_status(agent, remote_task_id)
            })
            .await?;
        RemoteStatus::parse(&raw)
    }

    pub async fn fetch_file(&self, agent: &str, file_name: &str) -> Result<Vec<u8>> {
        self.call("fetch_file", || self.executor.fetch_file(agent, file_name))
            .await
    }

    async fn call<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.timeout;
        with_retry(&self.retry, name, || {
            let fut = op();
            async move {
                tokio::time::timeout(timeout, fut)
                    .await
                    .map_err(|_| Error::Timeout(format!("Remote call exceeded {:?}", timeout)))?
            }
        })
        .await
    }
}
