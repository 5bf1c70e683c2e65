//! Storage module for dbguard
//!
//! - `db`: SQLite - policy catalog, 생성된 policy, membership, query log
//! - `json`: JSON - 설정 파일 저장/로드

mod db;
mod json;

// SQLite Storage (policy 데이터)
pub use db::{
    ActorRecord, ConnectionRecord, DatabaseRecord, GroupListPolicyRecord, GroupRecord,
    MembershipRecord, ObjectRecord, PolicyRecord, PolicySource, PolicyStore, PolicyWriter,
    QueryLogRecord, TemplateRecord, ALL_DATABASES, ALL_OBJECTS,
};

// JSON Storage (범용)
pub use json::JsonStore;
