//! Job Registry - tracks remote background jobs to completion
//!
//! 두 가지 완료 경로:
//! - Polling: 주기적으로 원격 상태를 조회
//! - Notification: agent가 결과 파일과 checksum을 직접 push
//!
//! 어느 쪽이든 먼저 도착한 신호가 job을 `resolved`로 표시하고,
//! 나중 신호는 no-op이 된다. Completion handler는 job당 최대 한 번 실행된다.

use crate::handler::{HandlerKind, HandlerRegistry};
use crate::job::{normalize_paging, Job, JobPage, JobSpec};
use crate::state::JobStatus;
use chrono::Utc;
use dbguard_foundation::{Error, RemoteClient, RemoteStatus, Result};
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Max status checks in flight during one polling sweep
const POLL_CONCURRENCY: usize = 8;

/// Context keys written by a notification
pub const CTX_FILE_NAME: &str = "file_name";
pub const CTX_CHECKSUM: &str = "checksum";
pub const CTX_NOTIFIED_SUCCESS: &str = "notified_success";

/// Job Registry - explicit service object shared by every job producer
#[derive(Clone)]
pub struct JobRegistry {
    /// All jobs by ID
    jobs: Arc<RwLock<HashMap<String, Job>>>,

    /// Status checks for polled jobs
    remote: RemoteClient,

    /// Completion handlers by tag
    handlers: HandlerRegistry,

    /// Signalled on every terminal transition
    changed: Arc<Notify>,
}

impl JobRegistry {
    /// Create a new registry
    pub fn new(remote: RemoteClient, handlers: HandlerRegistry) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            remote,
            handlers,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    // ========================================================================
    // Registration / Queries
    // ========================================================================

    /// Begin tracking a job
    pub async fn register(&self, spec: JobSpec) -> Result<Job> {
        if spec.id.is_empty() {
            return Err(Error::InvalidInput("Job id must not be empty".to_string()));
        }

        let job = Job::from_spec(spec);
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::InvalidState(format!(
                "Job {} is already registered",
                job.id
            )));
        }

        info!(job_id = %job.id, scope = ?job.scope, "Registered job");
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Register a master job over already-registered sub-jobs
    pub async fn register_master(
        &self,
        master_id: &str,
        scope: Option<i64>,
        sub_jobs: Vec<String>,
        context: HashMap<String, Value>,
    ) -> Result<Job> {
        let master = {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(master_id) {
                return Err(Error::InvalidState(format!(
                    "Job {} is already registered",
                    master_id
                )));
            }
            if let Some(missing) = sub_jobs.iter().find(|id| !jobs.contains_key(*id)) {
                return Err(Error::NotFound(format!("Sub-job {}", missing)));
            }

            let mut spec = JobSpec::new(master_id).handler(HandlerKind::Composite);
            spec.scope = scope;
            spec.context = context;
            let mut master = Job::from_spec(spec);
            master.resolved = true;
            master.total = sub_jobs.len() as u32;
            master.sub_jobs = sub_jobs.clone();

            for id in &sub_jobs {
                if let Some(sub) = jobs.get_mut(id) {
                    sub.parent = Some(master_id.to_string());
                }
            }

            jobs.insert(master_id.to_string(), master.clone());
            master
        };

        info!(
            "Registered master job {} with {} sub-jobs",
            master_id,
            master.sub_jobs.len()
        );

        // Sub-jobs may already be done
        self.check_master(master_id).await;
        Ok(master)
    }

    /// Get a job (copy)
    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).cloned()
    }

    /// All jobs, oldest first
    pub async fn list_all(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// One page of jobs; invalid input falls back to 1 / 10
    pub async fn list_paged(&self, page: i64, page_size: i64) -> JobPage {
        let (page, page_size) = normalize_paging(page, page_size);
        let all = self.list_all().await;
        let total = all.len();
        let start = (page - 1).saturating_mul(page_size);

        JobPage {
            items: all.into_iter().skip(start).take(page_size).collect(),
            page,
            page_size,
            total,
            total_pages: total.div_ceil(page_size),
        }
    }

    /// Jobs owned by a scope
    pub async fn list_by_scope(&self, scope: i64) -> Vec<Job> {
        self.list_all()
            .await
            .into_iter()
            .filter(|job| job.scope == Some(scope))
            .collect()
    }

    /// Remove a job (explicit operator action only)
    pub async fn delete(&self, job_id: &str) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .remove(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        info!("Deleted job {}", job_id);
        Ok(job)
    }

    /// Number of tracked jobs
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait_for(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.get(job_id).await {
                    None => return Err(Error::NotFound(format!("Job {}", job_id))),
                    Some(job) if job.status.is_terminal() => return Ok(job),
                    Some(_) => notified.await,
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("Job {} did not finish in {:?}", job_id, timeout)))?
    }

    // ========================================================================
    // Notification path
    // ========================================================================

    /// Out-of-band completion pushed by the agent
    ///
    /// Returns `false` when the job was already resolved (no-op).
    pub async fn notify(
        &self,
        job_id: &str,
        file_name: &str,
        checksum: &str,
        success: bool,
    ) -> Result<bool> {
        let status = RemoteStatus {
            status: if success { "completed" } else { "failed" }.to_string(),
            progress: Some(100),
            result_file: Some(file_name.to_string()),
            error: (!success).then(|| format!("Agent reported failure for {}", file_name)),
            ..Default::default()
        };

        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;

        if job.resolved || job.status.is_terminal() {
            debug!("Notification for resolved job {} ignored", job_id);
            return Ok(false);
        }

        job.resolved = true;
        job.context
            .insert(CTX_FILE_NAME.to_string(), Value::from(file_name));
        job.context
            .insert(CTX_CHECKSUM.to_string(), Value::from(checksum));
        job.context
            .insert(CTX_NOTIFIED_SUCCESS.to_string(), Value::from(success));

        info!(job_id, file_name, success, "Job resolved by notification");
        let outcome = Self::resolve_locked(job, &status);
        drop(jobs);

        self.after_resolve(job_id, outcome, status).await;
        Ok(true)
    }

    /// Stop polling a job that has no single remote task behind it
    pub async fn mark_resolved_no_polling(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        job.resolved = true;
        Ok(())
    }

    // ========================================================================
    // Polling path
    // ========================================================================

    /// Start the background polling loop
    pub fn start_polling(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!("Job polling started (every {:?})", interval);
            loop {
                interval_timer.tick().await;
                let checked = this.poll_once().await;
                if checked > 0 {
                    debug!("Polling sweep checked {} jobs", checked);
                }
            }
        })
    }

    /// One polling sweep; returns the number of jobs checked
    pub async fn poll_once(&self) -> usize {
        let candidates: Vec<(String, String, String)> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .filter(|job| job.needs_polling())
                .filter_map(|job| {
                    job.transport.as_ref().map(|t| {
                        (
                            job.id.clone(),
                            t.agent_id.clone(),
                            t.remote_task_id.clone(),
                        )
                    })
                })
                .collect()
        };

        let checked = candidates.len();
        futures::stream::iter(candidates)
            .for_each_concurrent(POLL_CONCURRENCY, |(job_id, agent, task_id)| async move {
                match self.remote.check_status(&agent, &task_id).await {
                    Ok(status) => self.apply_status(&job_id, status).await,
                    Err(e) => self.apply_poll_error(&job_id, e).await,
                }
            })
            .await;

        checked
    }

    /// Apply a polled status (ignored if the job got resolved meanwhile)
    async fn apply_status(&self, job_id: &str, status: RemoteStatus) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };

        if job.resolved || job.status.is_terminal() {
            debug!("Stale status for resolved job {} dropped", job_id);
            return;
        }

        if !status.is_terminal() {
            Self::apply_progress(job, &status);
            return;
        }

        job.resolved = true;
        info!(job_id, status = %status.status, "Job resolved by polling");
        let outcome = Self::resolve_locked(job, &status);
        drop(jobs);

        self.after_resolve(job_id, outcome, status).await;
    }

    /// Transport / parse failure while polling → `error`
    async fn apply_poll_error(&self, job_id: &str, err: Error) {
        let job = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.resolved || job.status.is_terminal() {
                return;
            }

            let err = err.in_job(job_id, job.scope);
            warn!("{}", err);
            job.resolved = true;
            job.status = JobStatus::Error;
            job.error = Some(err.to_string());
            job.message = "Status check failed".to_string();
            job.ended_at = Some(Utc::now());
            job.clone()
        };

        self.on_terminal(&job).await;
    }

    fn apply_progress(job: &mut Job, status: &RemoteStatus) {
        if let Some(progress) = status.progress {
            job.progress = progress.min(100);
        }
        if let Some(message) = &status.message {
            job.message = message.clone();
        }
        if let Some(error) = &status.error {
            job.error = Some(error.clone());
        }
        if let Some(n) = status.completed {
            job.completed = n;
        }
        if let Some(n) = status.failed {
            job.failed = n;
        }
        if let Some(n) = status.total {
            job.total = n;
        }
        match &status.results {
            Some(Value::Object(map)) => merge_results(&mut job.results, map.clone()),
            Some(Value::Array(items)) => job.results = Value::Array(items.clone()),
            _ => {}
        }
    }

    /// Apply a terminal remote status under the write lock
    fn resolve_locked(job: &mut Job, status: &RemoteStatus) -> Resolution {
        Self::apply_progress(job, status);

        match job.handler.clone() {
            Some(kind) if !job.handler_dispatched => {
                job.handler_dispatched = true;
                job.status = JobStatus::Processing;
                Resolution::Dispatch(kind)
            }
            _ => {
                job.progress = 100;
                job.status = if status.is_success() {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                job.ended_at = Some(Utc::now());
                Resolution::Finished(job.clone())
            }
        }
    }

    async fn after_resolve(&self, job_id: &str, outcome: Resolution, status: RemoteStatus) {
        match outcome {
            Resolution::Dispatch(kind) => self.dispatch(job_id.to_string(), kind, status),
            Resolution::Finished(job) => self.on_terminal(&job).await,
        }
    }

    // ========================================================================
    // Handler dispatch
    // ========================================================================

    fn dispatch(&self, job_id: String, kind: HandlerKind, status: RemoteStatus) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_handler(&job_id, &kind, &status).await;
        });
    }

    async fn run_handler(&self, job_id: &str, kind: &HandlerKind, status: &RemoteStatus) {
        let Some(job) = self.get(job_id).await else {
            return;
        };

        debug!(job_id, handler = %kind, "Running completion handler");
        let outcome = match self.handlers.get(kind) {
            Some(handler) => AssertUnwindSafe(handler.handle(self, &job, status))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Internal(format!("Handler {} panicked", kind)))),
            None => Err(Error::NotFound(format!(
                "No completion handler registered for {}",
                kind
            ))),
        };

        let still_open = self
            .get(job_id)
            .await
            .map(|j| !j.status.is_terminal())
            .unwrap_or(false);
        if !still_open {
            return;
        }

        let finished = match outcome {
            Ok(()) => {
                let message = status
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Completed".to_string());
                self.complete_after_processing(job_id, message).await
            }
            Err(e) => {
                let e = e.in_job(job_id, job.scope);
                error!("{}", e);
                self.fail_after_processing(job_id, e.to_string()).await
            }
        };

        if let Err(e) = finished {
            debug!("Job {} finished concurrently: {}", job_id, e);
        }
    }

    // ========================================================================
    // Direct transitions
    // ========================================================================

    /// Result already known synchronously: complete without polling
    pub async fn complete_immediately(&self, job_id: &str, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.finish(job_id, "complete_immediately", move |job| {
            job.resolved = true;
            job.status = JobStatus::Completed;
            job.message = message;
        })
        .await
    }

    /// Failure already known synchronously: fail without polling
    pub async fn fail_immediately(&self, job_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.finish(job_id, "fail_immediately", move |job| {
            job.resolved = true;
            job.status = JobStatus::Failed;
            job.message = error.clone();
            job.error = Some(error);
        })
        .await
    }

    /// Handler finished its work successfully
    pub async fn complete_after_processing(
        &self,
        job_id: &str,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        self.finish(job_id, "complete_after_processing", move |job| {
            job.status = JobStatus::Completed;
            job.message = message;
        })
        .await
    }

    /// Handler failed; the error becomes the job message
    pub async fn fail_after_processing(&self, job_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.finish(job_id, "fail_after_processing", move |job| {
            job.status = JobStatus::Failed;
            job.message = error.clone();
            job.error = Some(error);
        })
        .await
    }

    async fn finish(&self, job_id: &str, op: &str, apply: impl FnOnce(&mut Job)) -> Result<()> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;

            if job.status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "{} on job {} which is already {}",
                    op, job_id, job.status
                )));
            }

            apply(job);
            job.progress = 100;
            job.ended_at = Some(Utc::now());
            job.clone()
        };

        self.on_terminal(&job).await;
        Ok(())
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Merge named result sections into the job's result object
    pub async fn update_results(&self, job_id: &str, sections: Map<String, Value>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        merge_results(&mut job.results, sections);
        Ok(())
    }

    /// Replace the job's results with an ordered list
    pub async fn set_results(&self, job_id: &str, items: Vec<Value>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        job.results = Value::Array(items);
        Ok(())
    }

    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        if job.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Job {} is already {}",
                job_id, job.status
            )));
        }
        job.progress = progress.min(100);
        job.message = message.into();
        Ok(())
    }

    pub async fn set_counts(&self, job_id: &str, completed: u32, failed: u32, total: u32) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        job.completed = completed;
        job.failed = failed;
        job.total = total;
        Ok(())
    }

    // ========================================================================
    // Terminal bookkeeping
    // ========================================================================

    async fn on_terminal(&self, job: &Job) {
        info!(job_id = %job.id, status = %job.status, "Job finished: {}", job.message);
        self.changed.notify_waiters();

        if let Some(parent) = &job.parent {
            self.check_master(parent).await;
        }
    }

    /// Dispatch the master's handler once every sub-job is terminal
    async fn check_master(&self, master_id: &str) {
        let kind = {
            let mut jobs = self.jobs.write().await;
            let sub_jobs = match jobs.get(master_id) {
                Some(master) if !master.handler_dispatched && !master.status.is_terminal() => {
                    master.sub_jobs.clone()
                }
                _ => return,
            };

            let all_done = sub_jobs.iter().all(|id| {
                jobs.get(id)
                    .map(|sub| sub.status.is_terminal())
                    .unwrap_or(true)
            });
            if !all_done {
                return;
            }

            let Some(master) = jobs.get_mut(master_id) else {
                return;
            };
            master.handler_dispatched = true;
            master.status = JobStatus::Processing;
            master.handler.clone().unwrap_or(HandlerKind::Composite)
        };

        let status = RemoteStatus {
            status: "completed".to_string(),
            ..Default::default()
        };
        self.dispatch(master_id.to_string(), kind, status);
    }
}

enum Resolution {
    Dispatch(HandlerKind),
    Finished(Job),
}

fn merge_results(results: &mut Value, sections: Map<String, Value>) {
    match results {
        Value::Object(existing) => existing.extend(sections),
        other => *other = Value::Object(sections),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dbguard_foundation::{EncodedCommand, RemoteConfig, RemoteExecutor};

    struct IdleExecutor;

    #[async_trait]
    impl RemoteExecutor for IdleExecutor {
        async fn execute(&self, _agent: &str, _command: &EncodedCommand) -> Result<String> {
            Ok(r#"{"status": "success"}"#.to_string())
        }
        async fn start_background(&self, _agent: &str, _command: &EncodedCommand) -> Result<String> {
            Ok("task".to_string())
        }
        async fn check_status(&self, _agent: &str, _id: &str) -> Result<String> {
            Ok(r#"{"status": "running", "progress": 50, "message": "dumping"}"#.to_string())
        }
        async fn fetch_file(&self, _agent: &str, _file: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn registry() -> JobRegistry {
        let remote = RemoteClient::new(Arc::new(IdleExecutor), &RemoteConfig::default());
        JobRegistry::new(remote, HandlerRegistry::new())
    }

    #[tokio::test]
    async fn test_register_and_get_copy() {
        let jobs = registry();
        jobs.register(JobSpec::new("a").scope(1)).await.unwrap();
        assert!(jobs.register(JobSpec::new("a")).await.is_err());

        let mut copy = jobs.get("a").await.unwrap();
        copy.message = "mutated".into();
        assert_eq!(jobs.get("a").await.unwrap().message, "");
    }

    #[tokio::test]
    async fn test_list_paged_laws() {
        let jobs = registry();
        for i in 0..23 {
            jobs.register(JobSpec::new(format!("job-{:02}", i)))
                .await
                .unwrap();
        }

        for (page, size) in [(1, 10), (2, 10), (3, 10), (1, 5), (5, 5), (1, 23), (2, 7)] {
            let result = jobs.list_paged(page, size).await;
            assert!(result.items.len() <= size as usize);
            assert_eq!(result.total, 23);
            assert_eq!(result.total_pages, 23usize.div_ceil(size as usize));
        }

        let fallback = jobs.list_paged(0, -1).await;
        assert_eq!((fallback.page, fallback.page_size), (1, 10));
        assert_eq!(fallback.items.len(), 10);

        let beyond = jobs.list_paged(9, 10).await;
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 23);
    }

    #[tokio::test]
    async fn test_polling_updates_progress() {
        let jobs = registry();
        jobs.register(JobSpec::new("a").transport("agent", "t1"))
            .await
            .unwrap();

        assert_eq!(jobs.poll_once().await, 1);
        let job = jobs.get("a").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 50);
        assert_eq!(job.message, "dumping");
    }

    #[tokio::test]
    async fn test_transition_on_terminal_job_is_rejected() {
        let jobs = registry();
        jobs.register(JobSpec::new("a")).await.unwrap();
        jobs.complete_immediately("a", "done").await.unwrap();

        let err = jobs.fail_after_processing("a", "late").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let job = jobs.get("a").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.message, "done");
    }

    #[tokio::test]
    async fn test_results_merge_and_replace() {
        let jobs = registry();
        jobs.register(JobSpec::new("a")).await.unwrap();

        let mut first = Map::new();
        first.insert("step1".into(), Value::from("ok"));
        jobs.update_results("a", first).await.unwrap();
        let mut second = Map::new();
        second.insert("step2".into(), Value::from("ok"));
        jobs.update_results("a", second).await.unwrap();

        let results = jobs.get("a").await.unwrap().results;
        assert_eq!(results["step1"], "ok");
        assert_eq!(results["step2"], "ok");

        jobs.set_results("a", vec![Value::from(1), Value::from(2)])
            .await
            .unwrap();
        assert_eq!(jobs.get("a").await.unwrap().results, serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_notify_unknown_job() {
        let jobs = registry();
        let err = jobs.notify("nope", "f", "c", true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_and_scope_listing() {
        let jobs = registry();
        jobs.register(JobSpec::new("a").scope(1)).await.unwrap();
        jobs.register(JobSpec::new("b").scope(2)).await.unwrap();

        assert_eq!(jobs.list_by_scope(1).await.len(), 1);
        jobs.delete("a").await.unwrap();
        assert!(jobs.get("a").await.is_none());
        assert!(jobs.delete("a").await.is_err());
        assert_eq!(jobs.len().await, 1);
    }
}
