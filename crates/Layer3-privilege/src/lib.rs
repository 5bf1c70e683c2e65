//! # dbguard-privilege
//!
//! Privilege discovery without touching the live server beyond one read:
//! the remote privilege tables are dumped once, replayed into an embedded
//! engine, and probed with parameterized templates.
//!
//! ## 구성
//!
//! - `schema` / `snapshot`: mirrored catalog tables, dump file format
//! - `session`: embedded engine scoped to one run
//! - `template` / `verdict`: probe definitions and allow/deny interpretation
//! - `classifier` / `runner` / `groups` / `pipeline`: tiered evaluation and commit
//! - `discovery`: background dump jobs and their completion handler
//! - `bulk`: grant/revoke changes pushed to the live server
//! - `catalog` / `export`: catalog import, rule artifacts

pub mod bulk;
pub mod catalog;
pub mod classifier;
pub mod discovery;
pub mod export;
pub mod groups;
pub mod pipeline;
pub mod runner;
pub mod schema;
pub mod session;
pub mod snapshot;
pub mod template;
pub mod verdict;

pub use bulk::{BulkPolicyService, BulkReport, PolicyChange, POLICY_UPDATE_ACTION};
pub use catalog::{CatalogFile, ImportSummary};
pub use classifier::{classify, ClassifiedTemplates, Tier};
pub use discovery::{
    dump_plan, DiscoveryHandler, DiscoveryService, DumpQuery, CTX_CONNECTION_ID, DUMP_ACTION,
};
pub use export::{Rule, RuleExporter, RuleSet};
pub use groups::{assign_groups, Assignment};
pub use pipeline::{EvaluationPipeline, EvaluationReport, ProcessedJobs, TierStats};
pub use runner::{ProbeOutcome, ProbeRunner, ProbeTask};
pub use schema::{DbFamily, MirrorTable, SUPER_GROUP_ID, WILDCARD_OBJECT_TYPE};
pub use session::{LoadReport, PrivilegeSession, SessionHandle, DEFAULT_STARTUP_TIMEOUT};
pub use snapshot::{sha256_hex, verify_checksum, QueryKey, Snapshot, SnapshotEntry};
pub use template::{ProbeTemplate, TemplateDefinition, TemplateVars};
pub use verdict::Verdict;
