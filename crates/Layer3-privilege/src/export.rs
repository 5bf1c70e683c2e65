//! Rule artifact export
//!
//! Connection 별 `rules-{id}.json`: enforcement 쪽이 읽는 평탄화된 grant 목록.

use dbguard_foundation::{JsonStore, PolicySource, PolicyStore, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One exported grant with names resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub actor: String,
    /// `None` = every database
    pub database: Option<String>,
    /// `None` = every object
    pub object: Option<String>,
    pub template_id: i64,
    pub enabled: bool,
    pub source: PolicySource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub connection_id: i64,
    pub generated_at: String,
    pub rules: Vec<Rule>,
}

/// Writes rule artifacts into a directory
#[derive(Debug, Clone)]
pub struct RuleExporter {
    store: JsonStore,
}

impl RuleExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(dir),
        }
    }

    pub fn file_name(connection_id: i64) -> String {
        format!("rules-{}.json", connection_id)
    }

    pub fn path_for(&self, connection_id: i64) -> PathBuf {
        self.store.file_path(&Self::file_name(connection_id))
    }

    pub fn dir(&self) -> &Path {
        self.store.base_dir()
    }

    /// Build the rule set from stored policies
    pub fn build(policies: &PolicyStore, connection_id: i64) -> Result<RuleSet> {
        let actors: HashMap<i64, String> = policies
            .list_actors(connection_id)?
            .into_iter()
            .map(|a| (a.id, a.identity()))
            .collect();
        let databases: HashMap<i64, String> = policies
            .list_databases(connection_id)?
            .into_iter()
            .map(|d| (d.id, d.name))
            .collect();
        let objects: HashMap<i64, String> = policies
            .list_objects(connection_id)?
            .into_iter()
            .map(|o| (o.id, o.name))
            .collect();

        let rules = policies
            .list_policies(connection_id)?
            .into_iter()
            .filter_map(|p| {
                let Some(actor) = actors.get(&p.actor_id) else {
                    warn!(policy = ?p.id, "Policy references unknown actor {}", p.actor_id);
                    return None;
                };
                Some(Rule {
                    actor: actor.clone(),
                    database: databases.get(&p.database_id).cloned(),
                    object: objects.get(&p.object_id).cloned(),
                    template_id: p.template_id,
                    enabled: p.enabled,
                    source: p.source,
                })
            })
            .collect();

        Ok(RuleSet {
            connection_id,
            generated_at: chrono::Utc::now().to_rfc3339(),
            rules,
        })
    }

    pub fn export(&self, policies: &PolicyStore, connection_id: i64) -> Result<PathBuf> {
        let rules = Self::build(policies, connection_id)?;
        let name = Self::file_name(connection_id);
        self.store.save(&name, &rules)?;
        info!(
            "Exported {} rules for connection {}",
            rules.rules.len(),
            connection_id
        );
        Ok(self.store.file_path(&name))
    }

    /// Regenerate in the background; failures are only logged
    pub fn spawn(&self, policies: PolicyStore, connection_id: i64) -> JoinHandle<()> {
        let exporter = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = exporter.export(&policies, connection_id) {
                warn!("Rule export for connection {} failed: {}", connection_id, e);
            }
        })
    }
}
