//! Guard Config - 통합 설정
//!
//! Job polling, remote call, discovery worker settings

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 설정 파일명
pub const GUARD_CONFIG_FILE: &str = "config.json";

// ============================================================================
// Guard Config (통합)
// ============================================================================

/// dbguard 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// 데이터 디렉토리 (policy DB 위치)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Job 폴링 설정
    #[serde(default)]
    pub jobs: JobsConfig,

    /// 원격 호출 설정
    #[serde(default)]
    pub remote: RemoteConfig,

    /// 권한 탐색 설정
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl GuardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<GuardConfig>(GUARD_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<GuardConfig>(GUARD_CONFIG_FILE)?
            {
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    /// 특정 파일에서 로드 (CLI `--config`)
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(GUARD_CONFIG_FILE);
        let mut config = Self::new();
        config.merge(JsonStore::new(dir).load(name)?);
        Ok(config)
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        let store = JsonStore::global()?;
        store.save(GUARD_CONFIG_FILE, self)
    }

    /// 데이터 디렉토리 (설정값 또는 ~/.dbguard)
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dbguard")
        })
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: GuardConfig) {
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        self.jobs.merge(other.jobs);
        self.remote.merge(other.remote);
        self.discovery.merge(other.discovery);
    }
}

// ============================================================================
// Jobs Config
// ============================================================================

/// Job 폴링 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsConfig {
    /// 폴링 주기 (초)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl JobsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    fn merge(&mut self, other: JobsConfig) {
        if other.poll_interval_secs != default_poll_interval() {
            self.poll_interval_secs = other.poll_interval_secs;
        }
    }
}

// ============================================================================
// Remote Config
// ============================================================================

/// 원격 명령 실행 설정 (timeout + retry)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// 호출당 타임아웃 (초)
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// 최대 재시도 횟수
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 첫 재시도 지연 (ms)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// 최대 재시도 지연 (ms)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_remote_timeout(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    fn merge(&mut self, other: RemoteConfig) {
        if other.timeout_secs != default_remote_timeout() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.max_retries != default_max_retries() {
            self.max_retries = other.max_retries;
        }
        if other.initial_delay_ms != default_initial_delay() {
            self.initial_delay_ms = other.initial_delay_ms;
        }
        if other.max_delay_ms != default_max_delay() {
            self.max_delay_ms = other.max_delay_ms;
        }
    }
}

// ============================================================================
// Discovery Config
// ============================================================================

/// 권한 탐색 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Super-privilege tier 워커 수
    #[serde(default = "default_super_workers")]
    pub super_tier_workers: usize,

    /// Action-wide tier 워커 수
    #[serde(default = "default_action_workers")]
    pub action_tier_workers: usize,

    /// Object-specific tier 워커 수
    #[serde(default = "default_object_workers")]
    pub object_tier_workers: usize,

    /// 실행한 probe 쿼리 전체를 query_logs 테이블에 기록
    #[serde(default)]
    pub persist_query_log: bool,

    /// Privilege session 기동 대기 시간 (ms)
    #[serde(default = "default_startup_timeout")]
    pub session_startup_timeout_ms: u64,

    /// Rule artifact 출력 디렉토리 (없으면 export 생략)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            super_tier_workers: default_super_workers(),
            action_tier_workers: default_action_workers(),
            object_tier_workers: default_object_workers(),
            persist_query_log: false,
            session_startup_timeout_ms: default_startup_timeout(),
            export_dir: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn session_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.session_startup_timeout_ms)
    }

    fn merge(&mut self, other: DiscoveryConfig) {
        if other.super_tier_workers != default_super_workers() {
            self.super_tier_workers = other.super_tier_workers;
        }
        if other.action_tier_workers != default_action_workers() {
            self.action_tier_workers = other.action_tier_workers;
        }
        if other.object_tier_workers != default_object_workers() {
            self.object_tier_workers = other.object_tier_workers;
        }
        self.persist_query_log = self.persist_query_log || other.persist_query_log;
        if other.session_startup_timeout_ms != default_startup_timeout() {
            self.session_startup_timeout_ms = other.session_startup_timeout_ms;
        }
        if other.export_dir.is_some() {
            self.export_dir = other.export_dir;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_poll_interval() -> u64 {
    10
}

fn default_remote_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_super_workers() -> usize {
    2
}

fn default_action_workers() -> usize {
    4
}

fn default_object_workers() -> usize {
    8
}

fn default_startup_timeout() -> u64 {
    5_000
}
