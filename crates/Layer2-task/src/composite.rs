//! Composite (master) jobs
//!
//! Master job은 원격 task가 없고 polling되지 않는다.
//! 모든 sub-job이 terminal 상태가 되면 한 번만 집계된다.

use crate::handler::CompletionHandler;
use crate::job::Job;
use crate::registry::JobRegistry;
use crate::state::JobStatus;
use async_trait::async_trait;
use dbguard_foundation::{truncate_message, RemoteStatus, Result};
use tracing::info;

/// Max length of one sub-job error inside the master message
pub const SUB_JOB_ERROR_LIMIT: usize = 200;

/// Built-in handler aggregating sub-job outcomes
pub struct CompositeHandler;

#[async_trait]
impl CompletionHandler for CompositeHandler {
    async fn handle(&self, jobs: &JobRegistry, job: &Job, _status: &RemoteStatus) -> Result<()> {
        let total = job.sub_jobs.len();
        let mut succeeded = 0usize;
        let mut errors = Vec::new();

        for sub_id in &job.sub_jobs {
            match jobs.get(sub_id).await {
                Some(sub) if sub.status == JobStatus::Completed => succeeded += 1,
                Some(sub) => {
                    let text = sub
                        .error
                        .clone()
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("{} {}", sub.id, sub.status));
                    errors.push(truncate_message(&text, SUB_JOB_ERROR_LIMIT));
                }
                None => errors.push(format!("{} not found", sub_id)),
            }
        }

        let failed = total - succeeded;
        jobs.set_counts(&job.id, succeeded as u32, failed as u32, total as u32)
            .await?;

        info!(
            "Master job {}: {} of {} sub-jobs succeeded",
            job.id, succeeded, total
        );

        if errors.is_empty() {
            jobs.complete_after_processing(
                &job.id,
                format!("{} of {} succeeded", total, total),
            )
            .await
        } else {
            jobs.fail_after_processing(
                &job.id,
                format!("{} of {} succeeded: {}", succeeded, total, errors.join("; ")),
            )
            .await
        }
    }
}
