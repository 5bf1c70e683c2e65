//! Privilege discovery
//!
//! 원격 agent에 privilege table dump를 요청하고 (background),
//! 완료되면 `DiscoveryHandler`가 snapshot을 받아 평가 파이프라인을 돌린다.
//!
//! ```text
//! request ──▶ agent (privilege_dump) ──▶ poll / notify
//!                                            │
//!            DiscoveryHandler ◀──────────────┘
//!              fetch file → checksum → session → pipeline → commit
//! ```

use crate::pipeline::{EvaluationPipeline, EvaluationReport};
use crate::schema::DbFamily;
use crate::session::{LoadReport, PrivilegeSession};
use crate::snapshot::{verify_checksum, QueryKey, Snapshot};
use async_trait::async_trait;
use dbguard_foundation::{
    CommandOutput, ConnectionRecord, DiscoveryConfig, Error, PolicyStore, RemoteCommand,
    RemoteStatus, Result,
};
use dbguard_task::{
    new_job_id, CompletionHandler, HandlerKind, Job, JobRegistry, JobSpec, CTX_CHECKSUM,
    CTX_FILE_NAME,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Remote action dumping the privilege catalog
pub const DUMP_ACTION: &str = "privilege_dump";

/// Job context key holding the connection id
pub const CTX_CONNECTION_ID: &str = "connection_id";

/// One query of the dump plan sent to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpQuery {
    pub query_key: String,
    pub query: String,
}

/// Dump plan for a family: one query per mirrored table
pub fn dump_plan(family: DbFamily) -> Vec<DumpQuery> {
    family
        .tables()
        .iter()
        .map(|table| DumpQuery {
            query_key: QueryKey::render(table.name, None, None, 0),
            query: table.dump_query(),
        })
        .collect()
}

// ============================================================================
// DiscoveryService
// ============================================================================

#[derive(Clone)]
pub struct DiscoveryService {
    store: PolicyStore,
    jobs: JobRegistry,
    pipeline: EvaluationPipeline,
}

impl DiscoveryService {
    pub fn new(store: PolicyStore, jobs: JobRegistry, config: DiscoveryConfig) -> Self {
        let pipeline = EvaluationPipeline::new(store.clone(), config);
        Self {
            store,
            jobs,
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &EvaluationPipeline {
        &self.pipeline
    }

    /// Completion handler sharing this service's processed-jobs set
    pub fn handler(&self) -> Arc<DiscoveryHandler> {
        Arc::new(DiscoveryHandler {
            store: self.store.clone(),
            pipeline: self.pipeline.clone(),
        })
    }

    /// Register the handler with the job registry
    pub fn install(&self) {
        self.jobs
            .handlers()
            .register(HandlerKind::PrivilegeDiscovery, self.handler());
    }

    /// Dispatch a background dump and track it as a job
    pub async fn request(&self, connection_id: i64) -> Result<Job> {
        let connection = load_connection(&self.store, connection_id)?;
        let family: DbFamily = connection.family.parse()?;
        let command = dump_command(&connection, family)?.background();

        let remote_task_id = self
            .jobs
            .remote()
            .start_background(&connection.agent_id, &command)
            .await?;

        let spec = JobSpec::new(new_job_id())
            .scope(connection_id)
            .transport(connection.agent_id.as_str(), remote_task_id)
            .handler(HandlerKind::PrivilegeDiscovery)
            .context(CTX_CONNECTION_ID, connection_id)
            .message("Privilege dump requested");
        self.jobs.register(spec).await
    }

    /// Dump synchronously and evaluate in place (small catalogs)
    pub async fn run_live(&self, connection_id: i64) -> Result<Job> {
        let connection = load_connection(&self.store, connection_id)?;
        let family: DbFamily = connection.family.parse()?;
        let job = self
            .jobs
            .register(
                JobSpec::new(new_job_id())
                    .scope(connection_id)
                    .context(CTX_CONNECTION_ID, connection_id)
                    .message("Live privilege dump"),
            )
            .await?;

        let outcome: Result<EvaluationReport> = async {
            let command = dump_command(&connection, family)?;
            let raw = self
                .jobs
                .remote()
                .execute(&connection.agent_id, &command)
                .await?;
            let output = CommandOutput::parse(&raw)?;
            if !output.is_success() {
                return Err(Error::remote(
                    connection.agent_id.as_str(),
                    output
                        .error
                        .or(output.message)
                        .unwrap_or_else(|| "privilege dump failed".to_string()),
                ));
            }
            let data = output
                .data
                .ok_or_else(|| Error::Parse("Dump output carries no snapshot".to_string()))?;
            let snapshot: Snapshot = serde_json::from_value(data)
                .map_err(|e| Error::Parse(format!("Invalid privilege snapshot: {}", e)))?;

            let (load, report) =
                evaluate_snapshot(&self.pipeline, &job.id, connection_id, family, snapshot)
                    .await?;
            self.jobs
                .update_results(&job.id, result_sections(&load, &report)?)
                .await?;
            Ok(report)
        }
        .await;

        self.finish_now(&job, outcome).await?;
        self.jobs
            .get(&job.id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Job {}", job.id)))
    }

    /// Evaluate a snapshot already on disk
    pub async fn run_offline(
        &self,
        connection_id: i64,
        snapshot: Snapshot,
    ) -> Result<EvaluationReport> {
        let connection = load_connection(&self.store, connection_id)?;
        let family: DbFamily = connection.family.parse()?;
        let job = self
            .jobs
            .register(
                JobSpec::new(new_job_id())
                    .scope(connection_id)
                    .context(CTX_CONNECTION_ID, connection_id)
                    .message("Offline privilege evaluation"),
            )
            .await?;

        let outcome =
            match evaluate_snapshot(&self.pipeline, &job.id, connection_id, family, snapshot).await
            {
                Ok((load, report)) => self
                    .jobs
                    .update_results(&job.id, result_sections(&load, &report)?)
                    .await
                    .map(|_| report),
                Err(e) => Err(e),
            };

        match outcome {
            Ok(report) => {
                self.jobs
                    .complete_immediately(&job.id, report.summary())
                    .await?;
                Ok(report)
            }
            Err(e) => {
                let e = e.in_job(&job.id, Some(connection_id));
                self.jobs.fail_immediately(&job.id, e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn finish_now(&self, job: &Job, outcome: Result<EvaluationReport>) -> Result<()> {
        match outcome {
            Ok(report) => self.jobs.complete_immediately(&job.id, report.summary()).await,
            Err(e) => {
                let e = e.in_job(&job.id, job.scope);
                warn!("{}", e);
                self.jobs.fail_immediately(&job.id, e.to_string()).await
            }
        }
    }
}

// ============================================================================
// DiscoveryHandler
// ============================================================================

/// Completion handler for `PrivilegeDiscovery` jobs
pub struct DiscoveryHandler {
    store: PolicyStore,
    pipeline: EvaluationPipeline,
}

impl DiscoveryHandler {
    pub fn new(store: PolicyStore, pipeline: EvaluationPipeline) -> Self {
        Self { store, pipeline }
    }
}

#[async_trait]
impl CompletionHandler for DiscoveryHandler {
    async fn handle(&self, jobs: &JobRegistry, job: &Job, status: &RemoteStatus) -> Result<()> {
        let connection_id = job
            .context_i64(CTX_CONNECTION_ID)
            .or(job.scope)
            .ok_or_else(|| Error::InvalidInput("Discovery job has no connection".to_string()))?;
        let connection = load_connection(&self.store, connection_id)?;
        let agent = job
            .transport
            .as_ref()
            .map(|t| t.agent_id.clone())
            .unwrap_or_else(|| connection.agent_id.clone());

        if !status.is_success() {
            return Err(Error::remote(
                agent,
                status
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("privilege dump ended as {}", status.status)),
            ));
        }

        let file = job
            .context_str(CTX_FILE_NAME)
            .or(status.result_file.as_deref())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::Validation("No snapshot file reported".to_string()))?;

        let bytes = jobs.remote().fetch_file(&agent, file).await?;
        if let Some(expected) = job.context_str(CTX_CHECKSUM).filter(|c| !c.is_empty()) {
            verify_checksum(&bytes, expected)?;
        }
        let snapshot = Snapshot::parse(&bytes)?;
        info!(job_id = %job.id, file, entries = snapshot.len(), "Snapshot fetched");

        jobs.update_progress(&job.id, 50, "Evaluating privileges")
            .await?;
        let family: DbFamily = connection.family.parse()?;
        let (load, report) =
            evaluate_snapshot(&self.pipeline, &job.id, connection_id, family, snapshot).await?;

        jobs.update_results(&job.id, result_sections(&load, &report)?)
            .await?;
        jobs.complete_after_processing(&job.id, report.summary())
            .await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn load_connection(store: &PolicyStore, connection_id: i64) -> Result<ConnectionRecord> {
    store
        .get_connection(connection_id)?
        .ok_or_else(|| Error::NotFound(format!("Connection {}", connection_id)))
}

fn dump_command(connection: &ConnectionRecord, family: DbFamily) -> Result<RemoteCommand> {
    let plan = serde_json::to_string(&dump_plan(family))?;
    Ok(RemoteCommand::new(
        family.as_str(),
        connection.host.as_str(),
        connection.port,
        DUMP_ACTION,
        plan,
    )
    .with_credentials(connection.username.as_str(), connection.password.as_str())
    .with_database(connection.service_name.clone().unwrap_or_default()))
}

fn result_sections(load: &LoadReport, report: &EvaluationReport) -> Result<Map<String, Value>> {
    let mut sections = Map::new();
    sections.insert("load".to_string(), serde_json::to_value(load)?);
    sections.insert("evaluation".to_string(), serde_json::to_value(report)?);
    Ok(sections)
}

/// Session lifecycle around one pipeline run; the session is always closed
pub(crate) async fn evaluate_snapshot(
    pipeline: &EvaluationPipeline,
    job_id: &str,
    connection_id: i64,
    family: DbFamily,
    snapshot: Snapshot,
) -> Result<(LoadReport, EvaluationReport)> {
    let session = Arc::new(
        PrivilegeSession::start(family, pipeline.config().session_startup_timeout()).await?,
    );

    let outcome: Result<(LoadReport, EvaluationReport)> = async {
        let loader = session.clone();
        let load = tokio::task::spawn_blocking(move || loader.load_snapshot(&snapshot))
            .await
            .map_err(|e| Error::Engine(format!("Snapshot load task failed: {}", e)))??;
        let report = pipeline
            .evaluate(job_id, connection_id, session.clone())
            .await?;
        Ok((load, report))
    }
    .await;

    session.close();
    outcome
}
