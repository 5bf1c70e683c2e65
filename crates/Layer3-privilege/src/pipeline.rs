//! Evaluation pipeline
//!
//! snapshot이 적재된 session 위에서 tier 순서대로 probe를 실행하고,
//! 결과를 policy / membership으로 합성해 한 transaction으로 커밋한다.
//!
//! ```text
//! classify ─▶ super tier ─▶ action-wide tier ─▶ object tier
//!                                                   │
//!                     group assignment ◀────────────┘
//!                            │
//!                 single transaction ─▶ background export
//! ```

use crate::classifier::{classify, ClassifiedTemplates, Tier};
use crate::export::RuleExporter;
use crate::groups::{assign_groups, Assignment};
use crate::runner::{ProbeOutcome, ProbeRunner, ProbeTask};
use crate::schema::{DbFamily, WILDCARD_OBJECT_TYPE};
use crate::session::PrivilegeSession;
use crate::template::{
    substitute, ProbeTemplate, TemplateVars, VAR_ACTOR, VAR_DATABASE, VAR_HOST, VAR_OBJECT,
    VAR_OBJECT_TYPE, VAR_SCOPE, VAR_USER,
};
use crate::verdict::Verdict;
use dbguard_foundation::{
    ActorRecord, DatabaseRecord, DiscoveryConfig, Error, GroupListPolicyRecord, GroupRecord,
    ObjectRecord, PolicyRecord, PolicyStore, QueryLogRecord, Result, ALL_DATABASES, ALL_OBJECTS,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// ProcessedJobs
// ============================================================================

/// Job ids whose results were already synthesized (process-wide)
#[derive(Debug, Clone, Default)]
pub struct ProcessedJobs {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ProcessedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a job id; a second claim fails
    pub fn claim(&self, job_id: &str) -> Result<()> {
        if self.inner.lock().insert(job_id.to_string()) {
            Ok(())
        } else {
            Err(Error::AlreadyProcessed(job_id.to_string()))
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.inner.lock().contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub probes: usize,
    pub allowed: usize,
    pub errors: usize,
}

/// Summary of one evaluation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub job_id: String,
    pub connection_id: i64,
    pub tiers: BTreeMap<&'static str, TierStats>,
    pub super_actors: usize,
    pub policies_removed: usize,
    pub policies_created: usize,
    pub group_memberships_added: usize,
    pub policy_memberships_added: usize,
    pub query_logs_written: usize,
}

impl EvaluationReport {
    pub fn probe_errors(&self) -> usize {
        self.tiers.values().map(|t| t.errors).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} policies, {} super actors, {} new group memberships, {} probe errors",
            self.policies_created,
            self.super_actors,
            self.group_memberships_added,
            self.probe_errors()
        )
    }
}

// ============================================================================
// Per-run state
// ============================================================================

type PolicyKey = (i64, i64, i64, i64);

/// Caches living for one run; each behind its own lock
#[derive(Default)]
struct RunState {
    super_actors: Mutex<HashSet<i64>>,
    granted_actions: Mutex<HashSet<(i64, i64)>>,
    allowed_keys: Mutex<HashSet<PolicyKey>>,
    allowed_templates: Mutex<HashMap<i64, HashSet<i64>>>,
    policies: Mutex<Vec<PolicyRecord>>,
    query_logs: Mutex<Vec<QueryLogRecord>>,
}

impl RunState {
    fn is_super(&self, actor_id: i64) -> bool {
        self.super_actors.lock().contains(&actor_id)
    }

    fn has_action(&self, actor_id: i64, action_id: i64) -> bool {
        self.granted_actions.lock().contains(&(actor_id, action_id))
    }
}

/// Catalog snapshot for one connection
struct Catalog {
    family: DbFamily,
    actors: Vec<ActorRecord>,
    databases: Vec<DatabaseRecord>,
    objects: Vec<ObjectRecord>,
    group_list_policies: Vec<GroupListPolicyRecord>,
    groups: Vec<GroupRecord>,
    templates: ClassifiedTemplates,
}

impl Catalog {
    fn database_name(&self, database_id: i64) -> Option<&str> {
        self.databases
            .iter()
            .find(|d| d.id == database_id)
            .map(|d| d.name.as_str())
    }
}

// ============================================================================
// EvaluationPipeline
// ============================================================================

#[derive(Clone)]
pub struct EvaluationPipeline {
    store: PolicyStore,
    config: DiscoveryConfig,
    processed: ProcessedJobs,
    exporter: Option<RuleExporter>,
}

impl EvaluationPipeline {
    pub fn new(store: PolicyStore, config: DiscoveryConfig) -> Self {
        let exporter = config.export_dir.clone().map(RuleExporter::new);
        Self {
            store,
            config,
            processed: ProcessedJobs::new(),
            exporter,
        }
    }

    /// Share a processed-jobs set with other pipelines
    pub fn with_processed(mut self, processed: ProcessedJobs) -> Self {
        self.processed = processed;
        self
    }

    pub fn processed(&self) -> &ProcessedJobs {
        &self.processed
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Evaluate a loaded session and commit the result for a connection
    pub async fn evaluate(
        &self,
        job_id: &str,
        connection_id: i64,
        session: Arc<PrivilegeSession>,
    ) -> Result<EvaluationReport> {
        self.processed.claim(job_id)?;

        let catalog = self.load_catalog(connection_id, session.family())?;
        let state = RunState::default();
        let mut report = EvaluationReport {
            job_id: job_id.to_string(),
            connection_id,
            ..Default::default()
        };

        info!(
            job_id,
            connection_id,
            family = %catalog.family,
            actors = catalog.actors.len(),
            templates = catalog.templates.len(),
            "Evaluating privileges"
        );

        // tier 간 순서 보장: 앞 tier 결과가 뒤 tier task 생성에 쓰인다
        for tier in Tier::ORDER {
            let tasks = build_tasks(tier, connection_id, &catalog, &state);
            let runner = ProbeRunner::new(self.workers_for(tier));
            let outcomes = runner.run(session.clone(), tasks).await?;

            let mut stats = TierStats {
                probes: outcomes.len(),
                ..Default::default()
            };
            for outcome in &outcomes {
                self.absorb(job_id, connection_id, tier, &catalog, &state, outcome, &mut stats);
            }
            debug!(
                tier = tier.as_str(),
                "Tier done: {} probes, {} allowed, {} errors",
                stats.probes,
                stats.allowed,
                stats.errors
            );
            report.tiers.insert(tier.as_str(), stats);
        }

        let assignments = self.assign(&catalog, &state);
        report.super_actors = state.super_actors.lock().len();

        let policies = std::mem::take(&mut *state.policies.lock());
        let query_logs = std::mem::take(&mut *state.query_logs.lock());

        let (removed, created, groups_added, glps_added) = self.store.with_transaction(|w| {
            let removed = w.delete_discovered_policies(connection_id)?;

            let mut created = 0;
            for policy in &policies {
                if w.insert_policy(policy)? {
                    created += 1;
                }
            }

            let (mut groups_added, mut glps_added) = (0, 0);
            for (actor_id, assignment) in &assignments {
                for group_id in &assignment.groups {
                    if w.insert_actor_group(*actor_id, *group_id)? {
                        groups_added += 1;
                    }
                }
                for policy_id in &assignment.policies {
                    if w.insert_actor_policy(*actor_id, *policy_id)? {
                        glps_added += 1;
                    }
                }
            }

            for log in &query_logs {
                w.insert_query_log(log)?;
            }

            Ok((removed, created, groups_added, glps_added))
        })?;

        report.policies_removed = removed;
        report.policies_created = created;
        report.group_memberships_added = groups_added;
        report.policy_memberships_added = glps_added;
        report.query_logs_written = query_logs.len();

        if let Some(exporter) = &self.exporter {
            exporter.spawn(self.store.clone(), connection_id);
        }

        info!(job_id, connection_id, "Evaluation committed: {}", report.summary());
        Ok(report)
    }

    fn workers_for(&self, tier: Tier) -> usize {
        match tier {
            Tier::Super => self.config.super_tier_workers,
            Tier::ActionWide => self.config.action_tier_workers,
            Tier::ObjectSpecific => self.config.object_tier_workers,
        }
    }

    fn load_catalog(&self, connection_id: i64, session_family: DbFamily) -> Result<Catalog> {
        let connection = self
            .store
            .get_connection(connection_id)?
            .ok_or_else(|| Error::NotFound(format!("Connection {}", connection_id)))?;
        let family: DbFamily = connection.family.parse()?;
        if family != session_family {
            return Err(Error::InvalidInput(format!(
                "Connection {} is {} but the session mirrors {}",
                connection_id, family, session_family
            )));
        }

        let group_list_policies = self.store.list_group_list_policies()?;
        let templates = classify(family, &self.store.list_templates()?, &group_list_policies);

        Ok(Catalog {
            family,
            actors: self.store.list_actors(connection_id)?,
            databases: self.store.list_databases(connection_id)?,
            objects: self.store.list_objects(connection_id)?,
            groups: self.store.list_groups()?,
            group_list_policies,
            templates,
        })
    }

    /// Fold one outcome into the run state; strictly serial
    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &self,
        job_id: &str,
        connection_id: i64,
        tier: Tier,
        catalog: &Catalog,
        state: &RunState,
        outcome: &ProbeOutcome,
        stats: &mut TierStats,
    ) {
        let verdict = match &outcome.error {
            Some(e) => {
                stats.errors += 1;
                warn!(
                    template_id = outcome.template_id,
                    actor_id = outcome.actor_id,
                    "Probe failed: {}",
                    e
                );
                None
            }
            None => catalog
                .templates
                .tier(tier)
                .iter()
                .find(|t| t.id == outcome.template_id)
                .map(|t| {
                    Verdict::from_rows(&outcome.rows, &t.definition.allow, &t.definition.deny)
                }),
        };

        if self.config.persist_query_log {
            state.query_logs.lock().push(QueryLogRecord {
                job_id: job_id.to_string(),
                template_id: outcome.template_id,
                actor_id: outcome.actor_id,
                database_id: outcome.database_id,
                object_id: outcome.object_id,
                query_text: outcome.query.clone(),
                verdict: verdict.map_or("error", |v| v.as_str()).to_string(),
                error_message: outcome.error.clone(),
                duration_ms: outcome.elapsed_ms as i64,
            });
        }

        if !verdict.is_some_and(|v| v.is_allowed()) {
            return;
        }
        stats.allowed += 1;

        let key = (
            outcome.actor_id,
            outcome.database_id,
            outcome.object_id,
            outcome.template_id,
        );
        if state.allowed_keys.lock().insert(key) {
            state.policies.lock().push(PolicyRecord::discovered(
                connection_id,
                outcome.actor_id,
                outcome.database_id,
                outcome.object_id,
                outcome.template_id,
            ));
        }
        state
            .allowed_templates
            .lock()
            .entry(outcome.actor_id)
            .or_default()
            .insert(outcome.template_id);
        state
            .granted_actions
            .lock()
            .insert((outcome.actor_id, outcome.action_id));
        if tier == Tier::Super {
            state.super_actors.lock().insert(outcome.actor_id);
        }
    }

    fn assign(&self, catalog: &Catalog, state: &RunState) -> Vec<(i64, Assignment)> {
        let allowed = state.allowed_templates.lock();
        let empty = HashSet::new();
        catalog
            .actors
            .iter()
            .map(|actor| {
                let assignment = assign_groups(
                    state.is_super(actor.id),
                    allowed.get(&actor.id).unwrap_or(&empty),
                    &catalog.group_list_policies,
                    &catalog.groups,
                );
                (actor.id, assignment)
            })
            .filter(|(_, a)| !a.groups.is_empty() || !a.policies.is_empty())
            .collect()
    }
}

// ============================================================================
// Task building
// ============================================================================

fn actor_vars(actor: &ActorRecord, connection_id: i64) -> TemplateVars {
    TemplateVars::new()
        .set(VAR_ACTOR, actor.identity())
        .set(VAR_USER, actor.user.as_str())
        .set(VAR_HOST, actor.host.as_str())
        .set(VAR_SCOPE, connection_id.to_string())
}

fn task(
    template: &ProbeTemplate,
    actor: &ActorRecord,
    database_id: i64,
    object_id: i64,
    query: String,
) -> ProbeTask {
    ProbeTask {
        template_id: template.id,
        action_id: template.action_id,
        actor_id: actor.id,
        database_id,
        object_id,
        query,
        rejection: None,
    }
}

fn build_tasks(
    tier: Tier,
    connection_id: i64,
    catalog: &Catalog,
    state: &RunState,
) -> Vec<ProbeTask> {
    let mut tasks = Vec::new();

    for template in catalog.templates.tier(tier) {
        for actor in &catalog.actors {
            if tier != Tier::Super && state.is_super(actor.id) {
                continue;
            }
            if tier == Tier::ObjectSpecific && state.has_action(actor.id, template.action_id) {
                continue;
            }

            let vars = actor_vars(actor, connection_id);
            match tier {
                Tier::Super | Tier::ActionWide => {
                    let query = substitute(&template.definition.query, &vars);
                    tasks.push(task(template, actor, ALL_DATABASES, ALL_OBJECTS, query));
                }
                Tier::ObjectSpecific => {
                    object_tasks(template, actor, vars, catalog, &mut tasks);
                }
            }
        }
    }

    tasks
}

fn object_tasks(
    template: &ProbeTemplate,
    actor: &ActorRecord,
    vars: TemplateVars,
    catalog: &Catalog,
    tasks: &mut Vec<ProbeTask>,
) {
    if template.uses(VAR_OBJECT) {
        if template.object_type_id == WILDCARD_OBJECT_TYPE {
            let query = template.query_for_object().to_string();
            tasks.push(
                task(template, actor, ALL_DATABASES, ALL_OBJECTS, query).reject(
                    Error::NotImplemented(format!(
                        "Template {} probes ${{object}} for every object type",
                        template.id
                    )),
                ),
            );
            return;
        }

        for object in catalog
            .objects
            .iter()
            .filter(|o| o.object_type_id == template.object_type_id)
        {
            let vars = vars
                .clone()
                .set(
                    VAR_DATABASE,
                    catalog.database_name(object.database_id).unwrap_or_default(),
                )
                .set(VAR_OBJECT, object.name.as_str())
                .set(VAR_OBJECT_TYPE, object.object_type_id.to_string());
            let query = substitute(template.query_for_object(), &vars);
            tasks.push(task(template, actor, object.database_id, object.id, query));
        }
    } else if template.uses(VAR_DATABASE) {
        for database in &catalog.databases {
            let vars = vars.clone().set(VAR_DATABASE, database.name.as_str());
            let query = substitute(&template.definition.query, &vars);
            tasks.push(task(template, actor, database.id, ALL_OBJECTS, query));
        }
    } else {
        let query = substitute(&template.definition.query, &vars);
        tasks.push(task(template, actor, ALL_DATABASES, ALL_OBJECTS, query));
    }
}
