//! Discovery jobs end to end: dump request, completion signal, handler, commit

mod common;

use common::*;
use dbguard_foundation::ExecutionOption;
use dbguard_privilege::{sha256_hex, DiscoveryService, DumpQuery, CTX_CONNECTION_ID, DUMP_ACTION};
use dbguard_task::{JobRegistry, JobStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn setup() -> (Arc<FakeAgent>, JobRegistry, DiscoveryService) {
    let agent = Arc::new(FakeAgent::default());
    let jobs = jobs(&agent);
    let service = DiscoveryService::new(store(), jobs.clone(), config());
    service.install();
    (agent, jobs, service)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_dispatches_background_dump() {
    let (agent, jobs, service) = setup();

    let job = service.request(CONNECTION).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.scope, Some(CONNECTION));
    assert_eq!(job.context_i64(CTX_CONNECTION_ID), Some(CONNECTION));
    assert_eq!(
        job.transport.as_ref().map(|t| t.remote_task_id.as_str()),
        Some("task-1")
    );
    assert!(jobs.get(&job.id).await.unwrap().needs_polling());

    let sent = agent.background.lock()[0].clone();
    assert_eq!(sent.action, DUMP_ACTION);
    assert_eq!(sent.option, ExecutionOption::Background);
    assert_eq!(sent.username, "dbguard");
    let plan: Vec<DumpQuery> = serde_json::from_str(&sent.query).unwrap();
    assert!(plan.iter().any(|q| q.query_key == "mysql.user||[0]"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notification_runs_pipeline_with_checksum() {
    let (agent, jobs, service) = setup();
    let bytes = snapshot_bytes();
    agent.files.lock().insert("dump-1.json".into(), bytes.clone());

    let job = service.request(CONNECTION).await.unwrap();
    let accepted = jobs
        .notify(&job.id, "dump-1.json", &sha256_hex(&bytes), true)
        .await
        .unwrap();
    assert!(accepted);

    let done = jobs.wait_for(&job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);
    assert!(done.message.contains("5 policies"));
    assert_eq!(done.results["evaluation"]["policies_created"], json!(5));
    assert_eq!(done.results["load"]["skipped_entries"], json!(1));
    assert_eq!(service.pipeline().store().count_policies(CONNECTION).unwrap(), 5);

    // a late poll for the same remote task changes nothing
    agent
        .statuses
        .lock()
        .insert("task-1".into(), r#"{"status": "completed"}"#.into());
    jobs.poll_once().await;
    assert!(service.pipeline().processed().contains(&job.id));
    assert_eq!(jobs.get(&job.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_polling_uses_reported_result_file() {
    let (agent, jobs, service) = setup();
    agent
        .files
        .lock()
        .insert("out/privs.json".into(), snapshot_bytes());

    let job = service.request(CONNECTION).await.unwrap();
    agent.statuses.lock().insert(
        "task-1".into(),
        r#"{"status": "completed", "result_file": "out/privs.json"}"#.into(),
    );
    jobs.poll_once().await;

    let done = jobs.wait_for(&job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_checksum_mismatch_fails_job() {
    let (agent, jobs, service) = setup();
    agent
        .files
        .lock()
        .insert("dump-1.json".into(), snapshot_bytes());

    let job = service.request(CONNECTION).await.unwrap();
    jobs.notify(&job.id, "dump-1.json", "00ff", true)
        .await
        .unwrap();

    let done = jobs.wait_for(&job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.unwrap_or_default();
    assert!(error.contains("checksum"));
    assert!(error.starts_with(&format!("Job {} (scope {})", job.id, CONNECTION)));
    assert_eq!(service.pipeline().store().count_policies(CONNECTION).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_reported_failure_fails_job() {
    let (_agent, jobs, service) = setup();

    let job = service.request(CONNECTION).await.unwrap();
    jobs.notify(&job.id, "dump-1.json", "", false).await.unwrap();

    let done = jobs.wait_for(&job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(!service.pipeline().processed().contains(&job.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_live_completes_immediately() {
    let (agent, jobs, service) = setup();
    *agent.dump_output.lock() = Some(
        json!({"status": "success", "data": snapshot_value()}).to_string(),
    );

    let job = service.run_live(CONNECTION).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert!(job.resolved);
    assert!(job.transport.is_none());
    assert_eq!(jobs.len().await, 1);
    assert_eq!(service.pipeline().store().count_policies(CONNECTION).unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_live_failure_fails_job() {
    let (agent, _jobs, service) = setup();
    *agent.dump_output.lock() =
        Some(json!({"status": "error", "error": "permission denied"}).to_string());

    let job = service.run_live(CONNECTION).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.message.contains("permission denied"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_offline_evaluates_local_snapshot() {
    let (_agent, jobs, service) = setup();

    let report = service.run_offline(CONNECTION, snapshot()).await.unwrap();
    assert_eq!(report.policies_created, 5);

    let all = jobs.list_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, JobStatus::Completed);
    assert_eq!(all[0].id, report.job_id);
}
