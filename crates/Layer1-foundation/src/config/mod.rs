//! Config - 통합 설정 관리
//!
//! - `guard.rs` - GuardConfig 통합 설정 (jobs, remote, discovery)

mod guard;

pub use guard::{DiscoveryConfig, GuardConfig, JobsConfig, RemoteConfig, GUARD_CONFIG_FILE};
