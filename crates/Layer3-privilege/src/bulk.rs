//! Bulk policy update
//!
//! 1. 검증: 모든 변경의 template / grant·revoke 문 / placeholder 확인 (하나라도 실패하면 중단)
//! 2. 실행: 문장마다 동기 원격 실행, 전부 `success`여야 함
//! 3. 저장: 한 transaction으로 policy upsert (`manual`)

use crate::schema::DbFamily;
use crate::template::{
    substitute, unresolved_placeholders, ProbeTemplate, TemplateVars, VAR_ACTOR, VAR_DATABASE,
    VAR_HOST, VAR_OBJECT, VAR_OBJECT_TYPE, VAR_SCOPE, VAR_USER,
};
use dbguard_foundation::{
    CommandOutput, ConnectionRecord, Error, PolicyRecord, PolicySource, PolicyStore, RemoteClient,
    RemoteCommand, Result, ALL_DATABASES, ALL_OBJECTS,
};
use dbguard_task::{new_job_id, Job, JobRegistry, JobSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Remote action carrying one grant/revoke statement
pub const POLICY_UPDATE_ACTION: &str = "policy_update";

/// Requested change to one grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChange {
    pub actor_id: i64,
    #[serde(default)]
    pub database_id: i64,
    #[serde(default)]
    pub object_id: i64,
    pub template_id: i64,
    /// `true` grants, `false` revokes
    pub enable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub applied: usize,
    pub enabled: usize,
    pub disabled: usize,
}

/// Validated change with its rendered statement
struct Prepared {
    change: PolicyChange,
    statement: String,
}

#[derive(Clone)]
pub struct BulkPolicyService {
    store: PolicyStore,
    remote: RemoteClient,
}

impl BulkPolicyService {
    pub fn new(store: PolicyStore, remote: RemoteClient) -> Self {
        Self { store, remote }
    }

    /// Validate, execute remotely, then persist; all or nothing
    pub async fn apply(&self, connection_id: i64, changes: Vec<PolicyChange>) -> Result<BulkReport> {
        if changes.is_empty() {
            return Err(Error::InvalidInput("No policy changes given".to_string()));
        }

        let connection = self
            .store
            .get_connection(connection_id)?
            .ok_or_else(|| Error::NotFound(format!("Connection {}", connection_id)))?;
        let family: DbFamily = connection.family.parse()?;
        let prepared = self.prepare(&connection, family, changes)?;

        let total = prepared.len();
        let mut failed = 0;
        for item in &prepared {
            let command = RemoteCommand::new(
                family.as_str(),
                connection.host.as_str(),
                connection.port,
                POLICY_UPDATE_ACTION,
                item.statement.as_str(),
            )
            .with_credentials(connection.username.as_str(), connection.password.as_str())
            .with_database(connection.service_name.clone().unwrap_or_default());

            let succeeded = match self.remote.execute(&connection.agent_id, &command).await {
                Ok(raw) => match CommandOutput::parse(&raw) {
                    Ok(output) if output.is_success() => true,
                    Ok(output) => {
                        warn!(
                            template_id = item.change.template_id,
                            "Policy statement rejected: {}",
                            output.error.or(output.message).unwrap_or_default()
                        );
                        false
                    }
                    Err(e) => {
                        warn!("Unreadable policy statement output: {}", e);
                        false
                    }
                },
                Err(e) => {
                    warn!("Policy statement not delivered: {}", e);
                    false
                }
            };
            if !succeeded {
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(Error::BulkUpdateFailed { failed, total });
        }

        self.store.with_transaction(|w| {
            for item in &prepared {
                w.upsert_policy_status(&PolicyRecord {
                    id: None,
                    connection_id,
                    actor_id: item.change.actor_id,
                    database_id: item.change.database_id,
                    object_id: item.change.object_id,
                    template_id: item.change.template_id,
                    enabled: item.change.enable,
                    source: PolicySource::Manual,
                    created_at: None,
                })?;
            }
            Ok(())
        })?;

        let enabled = prepared.iter().filter(|p| p.change.enable).count();
        let report = BulkReport {
            applied: total,
            enabled,
            disabled: total - enabled,
        };
        info!(
            connection_id,
            "Bulk policy update applied: {} granted, {} revoked", report.enabled, report.disabled
        );
        Ok(report)
    }

    /// Run `apply` as a tracked job that finishes immediately
    pub async fn submit(
        &self,
        jobs: &JobRegistry,
        connection_id: i64,
        changes: Vec<PolicyChange>,
    ) -> Result<Job> {
        let job = jobs
            .register(
                JobSpec::new(new_job_id())
                    .scope(connection_id)
                    .message(format!("Applying {} policy changes", changes.len())),
            )
            .await?;

        match self.apply(connection_id, changes).await {
            Ok(report) => {
                jobs.set_counts(&job.id, report.applied as u32, 0, report.applied as u32)
                    .await?;
                jobs.complete_immediately(
                    &job.id,
                    format!("{} policy changes applied", report.applied),
                )
                .await?;
            }
            Err(e) => {
                if let Error::BulkUpdateFailed { failed, total } = &e {
                    jobs.set_counts(
                        &job.id,
                        (total - failed) as u32,
                        *failed as u32,
                        *total as u32,
                    )
                    .await?;
                }
                let e = e.in_job(&job.id, Some(connection_id));
                jobs.fail_immediately(&job.id, e.to_string()).await?;
            }
        }

        jobs.get(&job.id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Job {}", job.id)))
    }

    fn prepare(
        &self,
        connection: &ConnectionRecord,
        family: DbFamily,
        changes: Vec<PolicyChange>,
    ) -> Result<Vec<Prepared>> {
        let templates: HashMap<i64, _> = self
            .store
            .list_templates()?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
        let actors: HashMap<i64, _> = self
            .store
            .list_actors(connection.id)?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        let databases: HashMap<i64, _> = self
            .store
            .list_databases(connection.id)?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let objects: HashMap<i64, _> = self
            .store
            .list_objects(connection.id)?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();

        changes
            .into_iter()
            .map(|change| {
                let record = templates
                    .get(&change.template_id)
                    .ok_or_else(|| Error::NotFound(format!("Template {}", change.template_id)))?;
                let template = ProbeTemplate::decode(record)?;
                if template.family != family {
                    return Err(Error::template(
                        template.id,
                        format!("belongs to {}, connection is {}", template.family, family),
                    ));
                }

                let actor = actors
                    .get(&change.actor_id)
                    .ok_or_else(|| Error::NotFound(format!("Actor {}", change.actor_id)))?;
                let mut vars = TemplateVars::new()
                    .set(VAR_ACTOR, actor.identity())
                    .set(VAR_USER, actor.user.as_str())
                    .set(VAR_HOST, actor.host.as_str())
                    .set(VAR_SCOPE, connection.id.to_string());

                if change.database_id != ALL_DATABASES {
                    let database = databases.get(&change.database_id).ok_or_else(|| {
                        Error::NotFound(format!("Database {}", change.database_id))
                    })?;
                    vars = vars.set(VAR_DATABASE, database.name.as_str());
                }
                if change.object_id != ALL_OBJECTS {
                    let object = objects
                        .get(&change.object_id)
                        .ok_or_else(|| Error::NotFound(format!("Object {}", change.object_id)))?;
                    vars = vars
                        .set(VAR_OBJECT, object.name.as_str())
                        .set(VAR_OBJECT_TYPE, object.object_type_id.to_string());
                    if let Some(database) = databases.get(&object.database_id) {
                        vars = vars.set(VAR_DATABASE, database.name.as_str());
                    }
                }

                let (kind, sql) = if change.enable {
                    ("grant", template.definition.grant_sql.as_deref())
                } else {
                    ("revoke", template.definition.revoke_sql.as_deref())
                };
                let sql = sql.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
                    Error::template(template.id, format!("has no {} statement", kind))
                })?;

                let statement = substitute(sql, &vars);
                let missing = unresolved_placeholders(&statement);
                if !missing.is_empty() {
                    return Err(Error::template(
                        template.id,
                        format!("unresolved placeholders: {}", missing.join(", ")),
                    ));
                }

                Ok(Prepared { change, statement })
            })
            .collect()
    }
}
