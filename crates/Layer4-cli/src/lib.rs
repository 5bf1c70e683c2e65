//! dbguard CLI
//!
//! - `commands`: subcommand 구현 (import, discover, policies, export)
//! - `offline`: 원격 agent 없이 동작하는 executor

pub mod commands;
pub mod offline;

pub use commands::{
    discover_offline, export_rules, import_catalog, list_rules, open_store, render_rules,
};
pub use offline::OfflineAgent;
