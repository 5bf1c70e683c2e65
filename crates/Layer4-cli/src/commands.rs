//! Subcommand 구현
//!
//! main.rs는 인자 파싱과 출력만 담당하고, 실제 동작은 여기서 한다.

use crate::offline::OfflineAgent;
use dbguard_foundation::{GuardConfig, PolicyStore, RemoteClient};
use dbguard_privilege::{
    verify_checksum, CatalogFile, DiscoveryService, EvaluationReport, ImportSummary, Rule,
    RuleExporter, RuleSet, Snapshot,
};
use dbguard_task::{HandlerRegistry, JobRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Policy DB 열기 (설정된 data dir)
pub fn open_store(config: &GuardConfig) -> anyhow::Result<PolicyStore> {
    let data_dir = config.resolved_data_dir();
    let store = PolicyStore::new(&data_dir)?;
    info!("Policy store at {}", data_dir.display());
    Ok(store)
}

pub fn import_catalog(store: &PolicyStore, path: &Path) -> anyhow::Result<ImportSummary> {
    let catalog = CatalogFile::load(path)?;
    Ok(catalog.import(store)?)
}

/// 로컬 snapshot 파일로 탐색 job 실행
pub async fn discover_offline(
    config: &GuardConfig,
    store: &PolicyStore,
    connection_id: i64,
    snapshot_path: &Path,
    checksum: Option<&str>,
) -> anyhow::Result<EvaluationReport> {
    let bytes = tokio::fs::read(snapshot_path).await?;
    if let Some(expected) = checksum {
        verify_checksum(&bytes, expected)?;
    }
    let snapshot = Snapshot::parse(&bytes)?;

    let remote = RemoteClient::new(Arc::new(OfflineAgent), &config.remote);
    let jobs = JobRegistry::new(remote, HandlerRegistry::new());
    let service = DiscoveryService::new(store.clone(), jobs, config.discovery.clone());
    service.install();

    let report = service.run_offline(connection_id, snapshot).await?;
    Ok(report)
}

pub fn list_rules(store: &PolicyStore, connection_id: i64) -> anyhow::Result<RuleSet> {
    Ok(RuleExporter::build(store, connection_id)?)
}

/// 기본 위치: 설정의 export dir, 없으면 `<data dir>/rules`
pub fn export_rules(
    config: &GuardConfig,
    store: &PolicyStore,
    connection_id: i64,
    dir: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    let dir = dir
        .or_else(|| config.discovery.export_dir.clone())
        .unwrap_or_else(|| config.resolved_data_dir().join("rules"));
    Ok(RuleExporter::new(dir).export(store, connection_id)?)
}

/// Rule 목록을 표 형식으로
pub fn render_rules(rules: &[Rule]) -> String {
    let mut out = format!(
        "{:<24} {:<16} {:<20} {:<9} {:<8} {:<10}\n",
        "Actor", "Database", "Object", "Template", "Enabled", "Source"
    );
    out.push_str(&"-".repeat(92));
    out.push('\n');
    for rule in rules {
        out.push_str(&format!(
            "{:<24} {:<16} {:<20} {:<9} {:<8} {:<10}\n",
            rule.actor,
            rule.database.as_deref().unwrap_or("*"),
            rule.object.as_deref().unwrap_or("*"),
            rule.template_id,
            if rule.enabled { "yes" } else { "no" },
            rule.source.as_str(),
        ));
    }
    out
}
