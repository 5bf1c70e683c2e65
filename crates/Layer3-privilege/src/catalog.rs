//! Catalog import
//!
//! Connection, actor, database/object, template, Group-List Policy, group을
//! JSON 파일 하나로 받아 PolicyStore에 넣는다. Template definition은 평문으로
//! 받고 저장할 때 encode.

use crate::schema::DbFamily;
use crate::template::TemplateDefinition;
use dbguard_foundation::{
    ConnectionRecord, Error, GroupListPolicyRecord, GroupRecord, PolicyStore, Result,
    TemplateRecord,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
    #[serde(default)]
    pub actors: Vec<ActorEntry>,
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
    #[serde(default)]
    pub templates: Vec<TemplateEntry>,
    #[serde(default)]
    pub group_list_policies: Vec<GroupListPolicyRecord>,
    #[serde(default)]
    pub groups: Vec<GroupRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorEntry {
    pub connection_id: i64,
    pub user: String,
    #[serde(default = "any_host")]
    pub host: String,
}

fn any_host() -> String {
    "%".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub connection_id: i64,
    pub name: String,
    #[serde(default)]
    pub objects: Vec<ObjectEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub object_type_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub id: i64,
    pub family: String,
    pub action_id: i64,
    #[serde(default)]
    pub object_type_id: i64,
    pub definition: TemplateDefinition,
}

impl TemplateEntry {
    pub fn to_record(&self) -> Result<TemplateRecord> {
        let family: DbFamily = self
            .family
            .parse()
            .map_err(|e: Error| Error::template(self.id, e.to_string()))?;
        Ok(TemplateRecord {
            id: self.id,
            family: family.as_str().to_string(),
            action_id: self.action_id,
            object_type_id: self.object_type_id,
            definition: self.definition.encode()?,
        })
    }
}

/// Counts of imported rows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub connections: usize,
    pub actors: usize,
    pub databases: usize,
    pub objects: usize,
    pub templates: usize,
    pub group_list_policies: usize,
    pub groups: usize,
}

impl CatalogFile {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Parse(format!("Invalid catalog: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Write everything into the store; templates are checked before any write
    pub fn import(&self, store: &PolicyStore) -> Result<ImportSummary> {
        let templates = self
            .templates
            .iter()
            .map(TemplateEntry::to_record)
            .collect::<Result<Vec<_>>>()?;

        let mut summary = ImportSummary::default();

        for connection in &self.connections {
            connection.family.parse::<DbFamily>()?;
            store.upsert_connection(connection)?;
            summary.connections += 1;
        }
        for actor in &self.actors {
            store.insert_actor(actor.connection_id, &actor.user, &actor.host)?;
            summary.actors += 1;
        }
        for database in &self.databases {
            let database_id = store.insert_database(database.connection_id, &database.name)?;
            summary.databases += 1;
            for object in &database.objects {
                store.insert_object(database_id, &object.name, object.object_type_id)?;
                summary.objects += 1;
            }
        }
        for template in &templates {
            store.upsert_template(template)?;
            summary.templates += 1;
        }
        for glp in &self.group_list_policies {
            store.upsert_group_list_policy(glp)?;
            summary.group_list_policies += 1;
        }
        for group in &self.groups {
            store.upsert_group(group)?;
            summary.groups += 1;
        }

        info!(
            "Catalog imported: {} connections, {} actors, {} templates",
            summary.connections, summary.actors, summary.templates
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "connections": [
            {"id": 1, "family": "mysql", "host": "db1", "port": 3306,
             "username": "dbguard", "agent_id": "agent-1"}
        ],
        "actors": [
            {"connection_id": 1, "user": "root"},
            {"connection_id": 1, "user": "app", "host": "10.0.0.%"}
        ],
        "databases": [
            {"connection_id": 1, "name": "sales",
             "objects": [{"name": "orders", "object_type_id": 1}]}
        ],
        "templates": [
            {"id": 1, "family": "MySQL", "action_id": 1,
             "definition": {"query": "SELECT Super_priv FROM mysql.user WHERE User = '${user}'",
                            "allow": "Y", "deny": "N"}}
        ],
        "group_list_policies": [{"id": 10, "name": "readers", "template_ids": [5]}],
        "groups": [{"id": 2, "name": "analysts", "required_policy_ids": [10]}]
    }"#;

    #[test]
    fn test_import_populates_store() {
        let store = PolicyStore::in_memory().unwrap();
        let summary = CatalogFile::parse(CATALOG).unwrap().import(&store).unwrap();

        assert_eq!(summary.actors, 2);
        assert_eq!(summary.objects, 1);
        let actors = store.list_actors(1).unwrap();
        assert!(actors.iter().any(|a| a.identity() == "root@%"));

        let templates = store.list_templates().unwrap();
        assert_eq!(templates[0].family, "mysql");
        let definition = TemplateDefinition::decode(&templates[0].definition).unwrap();
        assert_eq!(definition.allow, "Y");

        // re-import keeps catalog rows unique
        CatalogFile::parse(CATALOG).unwrap().import(&store).unwrap();
        assert_eq!(store.list_actors(1).unwrap().len(), 2);
    }

    #[test]
    fn test_bad_template_aborts_before_writes() {
        let mut catalog = CatalogFile::parse(CATALOG).unwrap();
        catalog.templates[0].family = "db2".into();

        let store = PolicyStore::in_memory().unwrap();
        let err = catalog.import(&store).unwrap_err();
        assert!(matches!(err, Error::Template { template_id: 1, .. }));
        assert!(store.get_connection(1).unwrap().is_none());
    }
}
