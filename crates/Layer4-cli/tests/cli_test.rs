//! Import, offline discovery and export through the command layer

use dbguard_cli::{discover_offline, export_rules, import_catalog, list_rules, open_store, render_rules};
use dbguard_foundation::GuardConfig;
use dbguard_privilege::sha256_hex;
use serde_json::{json, Value};
use std::path::Path;

fn write_catalog(dir: &Path) -> std::path::PathBuf {
    let catalog = json!({
        "connections": [
            {"id": 7, "family": "mysql", "host": "db1", "port": 3306,
             "username": "dbguard", "agent_id": "agent-1"}
        ],
        "actors": [
            {"connection_id": 7, "user": "root"},
            {"connection_id": 7, "user": "app"}
        ],
        "databases": [],
        "templates": [
            {"id": 1, "family": "mysql", "action_id": 1, "definition": {
                "query": "SELECT Super_priv FROM mysql.user WHERE User = '${user}' AND Host = '${host}'",
                "allow": "Y", "deny": "N"}},
            {"id": 5, "family": "mysql", "action_id": 2, "definition": {
                "query": "SELECT Select_priv FROM mysql.user WHERE User = '${user}' AND Host = '${host}'",
                "allow": "Y", "deny": "N"}}
        ],
        "group_list_policies": [],
        "groups": [{"id": 1, "name": "super", "required_policy_ids": []}]
    });
    let path = dir.join("catalog.json");
    std::fs::write(&path, catalog.to_string()).unwrap();
    path
}

fn user_row(user: &str, select: &str, super_priv: &str) -> Value {
    let mut row = vec![json!("%"), json!(user)];
    row.extend(std::iter::repeat(json!("N")).take(17));
    row[2] = json!(select);
    row[15] = json!(super_priv);
    Value::Array(row)
}

fn snapshot_bytes() -> Vec<u8> {
    serde_json::to_vec(&json!([
        {"query_key": "mysql.user||[0]", "status": "success", "result": [
            user_row("root", "Y", "Y"),
            user_row("app", "Y", "N")
        ]}
    ]))
    .unwrap()
}

fn config(dir: &Path) -> GuardConfig {
    GuardConfig {
        data_dir: Some(dir.join("data")),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_import_discover_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = open_store(&config).unwrap();

    let summary = import_catalog(&store, &write_catalog(dir.path())).unwrap();
    assert_eq!(summary.actors, 2);
    assert_eq!(summary.templates, 2);

    let bytes = snapshot_bytes();
    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(&snapshot, &bytes).unwrap();

    let report = discover_offline(&config, &store, 7, &snapshot, Some(&sha256_hex(&bytes)))
        .await
        .unwrap();
    // root: super only, app: select
    assert_eq!(report.policies_created, 2);
    assert_eq!(report.super_actors, 1);

    let rules = list_rules(&store, 7).unwrap();
    assert_eq!(rules.rules.len(), 2);
    let table = render_rules(&rules.rules);
    assert!(table.contains("root@%"));
    assert!(table.contains("app@%"));

    let path = export_rules(&config, &store, 7, None).unwrap();
    assert!(path.ends_with("rules/rules-7.json"));
    let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(written["rules"].as_array().map(Vec::len), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discover_rejects_bad_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = open_store(&config).unwrap();
    import_catalog(&store, &write_catalog(dir.path())).unwrap();

    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(&snapshot, snapshot_bytes()).unwrap();

    let err = discover_offline(&config, &store, 7, &snapshot, Some("00ff"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("checksum"));
    assert_eq!(store.count_policies(7).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discover_unknown_connection_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = open_store(&config).unwrap();

    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(&snapshot, snapshot_bytes()).unwrap();

    assert!(discover_offline(&config, &store, 99, &snapshot, None)
        .await
        .is_err());
}
