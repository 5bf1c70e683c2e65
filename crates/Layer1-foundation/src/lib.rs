//! # dbguard-foundation
//!
//! Foundation layer for dbguard:
//! - Error: 공통 에러 타입
//! - Config: 통합 설정 (GuardConfig)
//! - Storage: SQLite policy store, JsonStore (범용)
//! - Remote: 원격 agent 명령 codec, executor trait, retry
//!
//! ## 아키텍처
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  dbguard-task (JobRegistry)                  │
//! │  dbguard-privilege (discovery, bulk update)  │
//! │                     │                        │
//! │          ┌──────────┴──────────┐             │
//! │          ▼                     ▼             │
//! │    PolicyStore            RemoteClient       │
//! │    (SQLite)          (timeout + retry)       │
//! │                               │              │
//! │                               ▼              │
//! │                      RemoteExecutor (agent)  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod remote;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{truncate_message, Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{DiscoveryConfig, GuardConfig, JobsConfig, RemoteConfig, GUARD_CONFIG_FILE};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{
    ActorRecord, ConnectionRecord, DatabaseRecord, GroupListPolicyRecord, GroupRecord, JsonStore,
    MembershipRecord, ObjectRecord, PolicyRecord, PolicySource, PolicyStore, PolicyWriter,
    QueryLogRecord, TemplateRecord, ALL_DATABASES, ALL_OBJECTS,
};

// ============================================================================
// Remote
// ============================================================================
pub use remote::{
    with_retry, CommandOutput, EncodedCommand, ExecutionOption, RemoteClient, RemoteCommand,
    RemoteExecutor, RemoteStatus, RetryConfig,
};
