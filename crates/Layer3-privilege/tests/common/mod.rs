//! Shared fixture: one MySQL connection, three actors, a small template catalog
//! and a fake agent.

#![allow(dead_code)]

use async_trait::async_trait;
use dbguard_foundation::{
    DiscoveryConfig, EncodedCommand, Error, PolicyStore, RemoteClient, RemoteCommand,
    RemoteConfig, RemoteExecutor, Result,
};
use dbguard_privilege::{CatalogFile, Snapshot, DUMP_ACTION};
use dbguard_task::{HandlerRegistry, JobRegistry};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const CONNECTION: i64 = 1;
pub const AGENT: &str = "agent-1";

pub const SUPER_TEMPLATE: i64 = 1;
pub const SELECT_ANY: i64 = 5;
pub const SHOW_DATABASES: i64 = 6;
pub const SELECT_ON_DB: i64 = 7;
pub const SELECT_ON_TABLE: i64 = 8;
pub const WILDCARD_TABLE: i64 = 9;

pub const READERS_GLP: i64 = 10;
pub const READERS_GROUP: i64 = 2;

pub fn catalog() -> CatalogFile {
    let raw = json!({
        "connections": [
            {"id": CONNECTION, "family": "mysql", "host": "db1", "port": 3306,
             "username": "dbguard", "password": "pw", "agent_id": AGENT}
        ],
        "actors": [
            {"connection_id": CONNECTION, "user": "root"},
            {"connection_id": CONNECTION, "user": "app"},
            {"connection_id": CONNECTION, "user": "report"}
        ],
        "databases": [
            {"connection_id": CONNECTION, "name": "sales", "objects": [
                {"name": "orders", "object_type_id": 1},
                {"name": "customers", "object_type_id": 1}
            ]}
        ],
        "templates": [
            {"id": SUPER_TEMPLATE, "family": "mysql", "action_id": 1, "definition": {
                "query": "SELECT Super_priv FROM mysql.user WHERE User = '${user}' AND Host = '${host}'",
                "allow": "Y", "deny": "N"}},
            {"id": SELECT_ANY, "family": "mysql", "action_id": 2, "definition": {
                "query": "SELECT Select_priv FROM mysql.user WHERE User = '${user}' AND Host = '${host}'",
                "allow": "Y", "deny": "N",
                "grant_sql": "GRANT SELECT ON *.* TO '${user}'@'${host}'",
                "revoke_sql": "REVOKE SELECT ON *.* FROM '${user}'@'${host}'"}},
            {"id": SHOW_DATABASES, "family": "mysql", "action_id": 3, "definition": {
                "query": "SELECT Show_db_priv FROM mysql.user WHERE User = '${user}' AND Host = '${host}'",
                "allow": "Y", "deny": "N",
                "grant_sql": "GRANT SHOW DATABASES ON *.* TO '${user}'@'${host}'"}},
            {"id": SELECT_ON_DB, "family": "mysql", "action_id": 2, "object_type_id": 1, "definition": {
                "query": "SELECT Select_priv FROM mysql.db WHERE User = '${user}' AND Host = '${host}' AND Db = '${database}'",
                "allow": "Y", "deny": "N",
                "grant_sql": "GRANT SELECT ON `${database}`.* TO '${user}'@'${host}'"}},
            {"id": SELECT_ON_TABLE, "family": "mysql", "action_id": 4, "object_type_id": 1, "definition": {
                "query": "SELECT CASE WHEN Table_priv LIKE '%Select%' THEN 'Y' ELSE 'N' END FROM mysql.tables_priv WHERE User = '${user}' AND Host = '${host}' AND Db = '${database}' AND Table_name = '${object}'",
                "allow": "Y", "deny": "N",
                "grant_sql": "GRANT SELECT ON `${database}`.`${object}` TO '${user}'@'${host}'"}},
            {"id": WILDCARD_TABLE, "family": "mysql", "action_id": 5, "object_type_id": 0, "definition": {
                "query": "SELECT 'Y' FROM mysql.tables_priv WHERE Table_name = '${object}'",
                "allow": "Y", "deny": "N"}},
            {"id": 11, "family": "mysql", "action_id": 6, "definition": {
                "query": "SELECT 'Y'", "allow": "Y", "deny": "N"}},
            {"id": 2, "family": "oracle", "action_id": 1, "definition": {
                "query": "SELECT 'Y' FROM DBA_ROLE_PRIVS WHERE GRANTEE = '${user}' AND GRANTED_ROLE = 'DBA'",
                "allow": "Y", "deny": "N"}}
        ],
        "group_list_policies": [
            {"id": READERS_GLP, "name": "readers", "template_ids": [SELECT_ANY, SHOW_DATABASES]}
        ],
        "groups": [
            {"id": 1, "name": "super", "required_policy_ids": []},
            {"id": READERS_GROUP, "name": "readers", "required_policy_ids": [READERS_GLP]}
        ]
    });
    serde_json::from_value(raw).unwrap()
}

pub fn store() -> PolicyStore {
    let store = PolicyStore::in_memory().unwrap();
    catalog().import(&store).unwrap();
    store
}

/// Same catalog in `<dir>/dbguard.db`, reachable by a second connection
pub fn file_store(dir: &std::path::Path) -> PolicyStore {
    let store = PolicyStore::new(dir).unwrap();
    catalog().import(&store).unwrap();
    store
}

/// `mysql.user` row with the privilege columns used by the catalog
fn user_row(user: &str, select: &str, show_db: &str, super_priv: &str) -> Value {
    let mut row = vec![json!("%"), json!(user)];
    row.extend(std::iter::repeat(json!("N")).take(17));
    row[2] = json!(select);
    row[14] = json!(show_db);
    row[15] = json!(super_priv);
    Value::Array(row)
}

pub fn snapshot_value() -> Value {
    json!([
        {
            "query_key": "mysql.user||[0]",
            "query": "SELECT ... FROM mysql.user",
            "status": "success",
            "result": [
                user_row("root", "Y", "Y", "Y"),
                user_row("app", "Y", "Y", "N"),
                user_row("report", "N", "N", "N")
            ]
        },
        {
            "query_key": "mysql.db||[0]",
            "result": [["%", "sales", "report", "Y"]]
        },
        {
            "key": "mysql.tables_priv:sales#0",
            "rows": [["%", "sales", "report", "orders", "root@localhost", "2024-01-01 00:00:00", "Select", ""]]
        },
        {
            "query_key": "mysql.role_edges||[0]",
            "status": "error",
            "result": []
        }
    ])
}

pub fn snapshot_bytes() -> Vec<u8> {
    serde_json::to_vec(&snapshot_value()).unwrap()
}

pub fn snapshot() -> Snapshot {
    Snapshot::parse(&snapshot_bytes()).unwrap()
}

pub fn config() -> DiscoveryConfig {
    DiscoveryConfig {
        super_tier_workers: 2,
        action_tier_workers: 2,
        object_tier_workers: 3,
        ..Default::default()
    }
}

pub fn actor_id(store: &PolicyStore, user: &str) -> i64 {
    store
        .list_actors(CONNECTION)
        .unwrap()
        .into_iter()
        .find(|a| a.user == user)
        .map(|a| a.id)
        .unwrap()
}

pub fn database_id(store: &PolicyStore, name: &str) -> i64 {
    store
        .list_databases(CONNECTION)
        .unwrap()
        .into_iter()
        .find(|d| d.name == name)
        .map(|d| d.id)
        .unwrap()
}

pub fn object_id(store: &PolicyStore, name: &str) -> i64 {
    store
        .list_objects(CONNECTION)
        .unwrap()
        .into_iter()
        .find(|o| o.name == name)
        .map(|o| o.id)
        .unwrap()
}

// ============================================================================
// Fake agent
// ============================================================================

/// Agent answering from in-memory scripts
#[derive(Default)]
pub struct FakeAgent {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub statuses: Mutex<HashMap<String, String>>,
    /// Raw output returned for a synchronous dump
    pub dump_output: Mutex<Option<String>>,
    /// Statements containing any of these are answered with an error
    pub reject_containing: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<RemoteCommand>>,
    pub background: Mutex<Vec<RemoteCommand>>,
}

impl FakeAgent {
    pub fn executed_queries(&self) -> Vec<String> {
        self.executed.lock().iter().map(|c| c.query.clone()).collect()
    }
}

#[async_trait]
impl RemoteExecutor for FakeAgent {
    async fn execute(&self, _agent: &str, command: &EncodedCommand) -> Result<String> {
        let command = command.decode()?;
        self.executed.lock().push(command.clone());

        if command.action == DUMP_ACTION {
            return self
                .dump_output
                .lock()
                .clone()
                .ok_or_else(|| Error::Transport("dump unavailable".into()));
        }

        let rejected = self
            .reject_containing
            .lock()
            .iter()
            .any(|marker| command.query.contains(marker.as_str()));
        if rejected {
            Ok(r#"{"status": "error", "error": "access denied"}"#.to_string())
        } else {
            Ok(r#"{"status": "success"}"#.to_string())
        }
    }

    async fn start_background(&self, _agent: &str, command: &EncodedCommand) -> Result<String> {
        let mut background = self.background.lock();
        background.push(command.decode()?);
        Ok(format!("task-{}", background.len()))
    }

    async fn check_status(&self, _agent: &str, task: &str) -> Result<String> {
        self.statuses
            .lock()
            .get(task)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown task {}", task)))
    }

    async fn fetch_file(&self, agent: &str, file: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(file)
            .cloned()
            .ok_or_else(|| Error::remote(agent, format!("no such file {}", file)))
    }
}

pub fn remote(agent: &Arc<FakeAgent>) -> RemoteClient {
    let config = RemoteConfig {
        max_retries: 0,
        ..Default::default()
    };
    RemoteClient::new(agent.clone(), &config)
}

pub fn jobs(agent: &Arc<FakeAgent>) -> JobRegistry {
    JobRegistry::new(remote(agent), HandlerRegistry::new())
}
