//! SQLite Storage for policy data
//!
//! 저장 데이터:
//! - Catalog: connections, actors, databases, objects, probe templates
//! - Group-List Policy / Group 정의
//! - Policies: 탐색 또는 수동으로 생성된 grant record
//! - Memberships: actor ↔ group, actor ↔ group-list policy (validity window)
//! - Query Logs: 탐색 실행 시 probe 쿼리 감사 로그 (옵션)
//!
//! ## Migration System
//!
//! Database schema is versioned. Migrations run automatically on startup.
//! - Version 1: Catalog, policies, memberships
//! - Version 2: Add query_logs table

use crate::{Error, Result};
use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Database id meaning "every database" on a policy record
pub const ALL_DATABASES: i64 = 0;

/// Object id meaning "every object" on a policy record
pub const ALL_OBJECTS: i64 = 0;

fn now_str() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Storage service for policy data
#[derive(Clone)]
pub struct PolicyStore {
    conn: Arc<Mutex<Connection>>,
}

impl PolicyStore {
    /// Create a new storage instance
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join("dbguard.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        Ok(storage)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    /// Initialize database schema (base tables)
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Remote database connections
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                family TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL DEFAULT '',
                service_name TEXT,
                agent_id TEXT NOT NULL
            );

            -- Database accounts (actors) discovered on a connection
            CREATE TABLE IF NOT EXISTS db_actors (
                id INTEGER PRIMARY KEY,
                connection_id INTEGER NOT NULL,
                user TEXT NOT NULL,
                host TEXT NOT NULL DEFAULT '%',
                UNIQUE (connection_id, user, host)
            );

            CREATE TABLE IF NOT EXISTS db_databases (
                id INTEGER PRIMARY KEY,
                connection_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (connection_id, name)
            );

            CREATE TABLE IF NOT EXISTS db_objects (
                id INTEGER PRIMARY KEY,
                database_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                object_type_id INTEGER NOT NULL,
                UNIQUE (database_id, name, object_type_id)
            );

            -- Probe templates (definition is hex encoded JSON)
            CREATE TABLE IF NOT EXISTS policy_templates (
                id INTEGER PRIMARY KEY,
                family TEXT NOT NULL,
                action_id INTEGER NOT NULL,
                object_type_id INTEGER NOT NULL DEFAULT 0,
                definition TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_list_policies (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_list_policy_templates (
                policy_id INTEGER NOT NULL,
                template_id INTEGER NOT NULL,
                PRIMARY KEY (policy_id, template_id)
            );

            CREATE TABLE IF NOT EXISTS policy_groups (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_group_requirements (
                group_id INTEGER NOT NULL,
                policy_id INTEGER NOT NULL,
                PRIMARY KEY (group_id, policy_id)
            );

            -- Grant records (database/object 0 = all)
            CREATE TABLE IF NOT EXISTS policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connection_id INTEGER NOT NULL,
                actor_id INTEGER NOT NULL,
                database_id INTEGER NOT NULL DEFAULT 0,
                object_id INTEGER NOT NULL DEFAULT 0,
                template_id INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                source TEXT NOT NULL CHECK(source IN ('discovered', 'manual')),
                created_at TEXT NOT NULL,
                UNIQUE (connection_id, actor_id, database_id, object_id, template_id)
            );

            CREATE INDEX IF NOT EXISTS idx_policies_connection
                ON policies(connection_id, source);

            CREATE TABLE IF NOT EXISTS actor_group_memberships (
                actor_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                valid_from TEXT NOT NULL,
                valid_until TEXT,
                PRIMARY KEY (actor_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS actor_policy_memberships (
                actor_id INTEGER NOT NULL,
                policy_id INTEGER NOT NULL,
                valid_from TEXT NOT NULL,
                valid_until TEXT,
                PRIMARY KEY (actor_id, policy_id)
            );

            -- Insert initial schema version if not exists
            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run all pending migrations
    fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running database migrations from version {} to {}",
            current_version, CURRENT_SCHEMA_VERSION
        );

        let conn = self.lock()?;

        for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
            match version {
                2 => Self::migrate_v2(&conn)?,
                _ => {
                    warn!("Unknown migration version: {}", version);
                }
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![version],
            )
            .map_err(|e| Error::Storage(format!("Failed to record migration: {}", e)))?;

            info!("Applied migration to version {}", version);
        }

        Ok(())
    }

    /// Migration to version 2: per-probe audit log
    fn migrate_v2(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS query_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                template_id INTEGER NOT NULL,
                actor_id INTEGER NOT NULL,
                database_id INTEGER NOT NULL,
                object_id INTEGER NOT NULL,
                query_text TEXT NOT NULL,
                verdict TEXT NOT NULL,
                error_message TEXT,
                duration_ms INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_query_logs_job ON query_logs(job_id);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to apply migration 2: {}", e)))
    }

    // ========================================================================
    // Catalog Operations
    // ========================================================================

    /// Insert or replace a connection
    pub fn upsert_connection(&self, record: &ConnectionRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO connections
                (id, family, host, port, username, password, service_name, agent_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.family,
                record.host,
                record.port,
                record.username,
                record.password,
                record.service_name,
                record.agent_id,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to save connection: {}", e)))?;
        Ok(())
    }

    /// Get a connection by ID
    pub fn get_connection(&self, id: i64) -> Result<Option<ConnectionRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            r#"
            SELECT id, family, host, port, username, password, service_name, agent_id
            FROM connections WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok(ConnectionRecord {
                    id: row.get(0)?,
                    family: row.get(1)?,
                    host: row.get(2)?,
                    port: row.get(3)?,
                    username: row.get(4)?,
                    password: row.get(5)?,
                    service_name: row.get(6)?,
                    agent_id: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get connection: {}", e)))
    }

    /// Insert an actor, returning its id (existing id when already present)
    pub fn insert_actor(&self, connection_id: i64, user: &str, host: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO db_actors (connection_id, user, host) VALUES (?1, ?2, ?3)",
            params![connection_id, user, host],
        )
        .map_err(|e| Error::Storage(format!("Failed to save actor: {}", e)))?;
        conn.query_row(
            "SELECT id FROM db_actors WHERE connection_id = ?1 AND user = ?2 AND host = ?3",
            params![connection_id, user, host],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to read actor id: {}", e)))
    }

    /// Actors of a connection, ordered by id
    pub fn list_actors(&self, connection_id: i64) -> Result<Vec<ActorRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, connection_id, user, host FROM db_actors WHERE connection_id = ?1 ORDER BY id",
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let actors = stmt
            .query_map(params![connection_id], |row| {
                Ok(ActorRecord {
                    id: row.get(0)?,
                    connection_id: row.get(1)?,
                    user: row.get(2)?,
                    host: row.get(3)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Failed to query actors: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read actors: {}", e)))?;

        Ok(actors)
    }

    /// Insert a database, returning its id
    pub fn insert_database(&self, connection_id: i64, name: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO db_databases (connection_id, name) VALUES (?1, ?2)",
            params![connection_id, name],
        )
        .map_err(|e| Error::Storage(format!("Failed to save database: {}", e)))?;
        conn.query_row(
            "SELECT id FROM db_databases WHERE connection_id = ?1 AND name = ?2",
            params![connection_id, name],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to read database id: {}", e)))
    }

    /// Databases of a connection, ordered by id
    pub fn list_databases(&self, connection_id: i64) -> Result<Vec<DatabaseRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, connection_id, name FROM db_databases WHERE connection_id = ?1 ORDER BY id",
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let databases = stmt
            .query_map(params![connection_id], |row| {
                Ok(DatabaseRecord {
                    id: row.get(0)?,
                    connection_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Failed to query databases: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read databases: {}", e)))?;

        Ok(databases)
    }

    /// Insert an object, returning its id
    pub fn insert_object(&self, database_id: i64, name: &str, object_type_id: i64) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO db_objects (database_id, name, object_type_id) VALUES (?1, ?2, ?3)",
            params![database_id, name, object_type_id],
        )
        .map_err(|e| Error::Storage(format!("Failed to save object: {}", e)))?;
        conn.query_row(
            "SELECT id FROM db_objects WHERE database_id = ?1 AND name = ?2 AND object_type_id = ?3",
            params![database_id, name, object_type_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to read object id: {}", e)))
    }

    /// Objects of every database on a connection
    pub fn list_objects(&self, connection_id: i64) -> Result<Vec<ObjectRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT o.id, o.database_id, o.name, o.object_type_id
                FROM db_objects o
                JOIN db_databases d ON d.id = o.database_id
                WHERE d.connection_id = ?1
                ORDER BY o.id
                "#,
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let objects = stmt
            .query_map(params![connection_id], |row| {
                Ok(ObjectRecord {
                    id: row.get(0)?,
                    database_id: row.get(1)?,
                    name: row.get(2)?,
                    object_type_id: row.get(3)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Failed to query objects: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read objects: {}", e)))?;

        Ok(objects)
    }

    /// Insert or replace a probe template
    pub fn upsert_template(&self, record: &TemplateRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO policy_templates (id, family, action_id, object_type_id, definition)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.id,
                record.family,
                record.action_id,
                record.object_type_id,
                record.definition,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to save template: {}", e)))?;
        Ok(())
    }

    /// All probe templates, ordered by id
    pub fn list_templates(&self) -> Result<Vec<TemplateRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, family, action_id, object_type_id, definition FROM policy_templates ORDER BY id",
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let templates = stmt
            .query_map([], |row| {
                Ok(TemplateRecord {
                    id: row.get(0)?,
                    family: row.get(1)?,
                    action_id: row.get(2)?,
                    object_type_id: row.get(3)?,
                    definition: row.get(4)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Failed to query templates: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read templates: {}", e)))?;

        Ok(templates)
    }

    /// Insert or replace a Group-List Policy and its template set
    pub fn upsert_group_list_policy(&self, record: &GroupListPolicyRecord) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO group_list_policies (id, name) VALUES (?1, ?2)",
            params![record.id, record.name],
        )?;
        tx.execute(
            "DELETE FROM group_list_policy_templates WHERE policy_id = ?1",
            params![record.id],
        )?;
        for template_id in &record.template_ids {
            tx.execute(
                "INSERT OR IGNORE INTO group_list_policy_templates (policy_id, template_id) VALUES (?1, ?2)",
                params![record.id, template_id],
            )?;
        }
        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to save group-list policy: {}", e)))
    }

    /// All Group-List Policies with their template sets
    pub fn list_group_list_policies(&self) -> Result<Vec<GroupListPolicyRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name FROM group_list_policies ORDER BY id")
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let mut policies = stmt
            .query_map([], |row| {
                Ok(GroupListPolicyRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    template_ids: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut members = conn.prepare(
            "SELECT template_id FROM group_list_policy_templates WHERE policy_id = ?1 ORDER BY template_id",
        )?;
        for policy in &mut policies {
            policy.template_ids = members
                .query_map(params![policy.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
        }

        Ok(policies)
    }

    /// Insert or replace a named Group and its required Group-List Policy set
    pub fn upsert_group(&self, record: &GroupRecord) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO policy_groups (id, name) VALUES (?1, ?2)",
            params![record.id, record.name],
        )?;
        tx.execute(
            "DELETE FROM policy_group_requirements WHERE group_id = ?1",
            params![record.id],
        )?;
        for policy_id in &record.required_policy_ids {
            tx.execute(
                "INSERT OR IGNORE INTO policy_group_requirements (group_id, policy_id) VALUES (?1, ?2)",
                params![record.id, policy_id],
            )?;
        }
        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to save group: {}", e)))
    }

    /// All named Groups with their requirements
    pub fn list_groups(&self) -> Result<Vec<GroupRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM policy_groups ORDER BY id")?;
        let mut groups = stmt
            .query_map([], |row| {
                Ok(GroupRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    required_policy_ids: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut reqs = conn.prepare(
            "SELECT policy_id FROM policy_group_requirements WHERE group_id = ?1 ORDER BY policy_id",
        )?;
        for group in &mut groups {
            group.required_policy_ids = reqs
                .query_map(params![group.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
        }

        Ok(groups)
    }

    // ========================================================================
    // Policy Operations
    // ========================================================================

    /// Policies of a connection, ordered by id
    pub fn list_policies(&self, connection_id: i64) -> Result<Vec<PolicyRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, connection_id, actor_id, database_id, object_id, template_id,
                       enabled, source, created_at
                FROM policies WHERE connection_id = ?1 ORDER BY id
                "#,
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let policies = stmt
            .query_map(params![connection_id], |row| {
                let source: String = row.get(7)?;
                Ok(PolicyRecord {
                    id: row.get(0)?,
                    connection_id: row.get(1)?,
                    actor_id: row.get(2)?,
                    database_id: row.get(3)?,
                    object_id: row.get(4)?,
                    template_id: row.get(5)?,
                    enabled: row.get(6)?,
                    source: PolicySource::from_str_lossy(&source),
                    created_at: row.get(8)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Failed to query policies: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read policies: {}", e)))?;

        Ok(policies)
    }

    /// Number of policies stored for a connection
    pub fn count_policies(&self, connection_id: i64) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM policies WHERE connection_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to count policies: {}", e)))
    }

    // ========================================================================
    // Membership Operations
    // ========================================================================

    /// Active group memberships of an actor
    pub fn active_actor_groups(&self, actor_id: i64) -> Result<Vec<MembershipRecord>> {
        self.active_memberships("actor_group_memberships", "group_id", actor_id)
    }

    /// Active Group-List Policy memberships of an actor
    pub fn active_actor_policies(&self, actor_id: i64) -> Result<Vec<MembershipRecord>> {
        self.active_memberships("actor_policy_memberships", "policy_id", actor_id)
    }

    fn active_memberships(
        &self,
        table: &str,
        target_column: &str,
        actor_id: i64,
    ) -> Result<Vec<MembershipRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT actor_id, {col}, valid_from, valid_until FROM {table}
            WHERE actor_id = ?1 AND valid_from <= ?2
              AND (valid_until IS NULL OR valid_until > ?2)
            ORDER BY {col}
            "#,
            col = target_column,
            table = table
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![actor_id, now_str()], |row| {
                Ok(MembershipRecord {
                    actor_id: row.get(0)?,
                    target_id: row.get(1)?,
                    valid_from: row.get(2)?,
                    valid_until: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read memberships: {}", e)))?;
        Ok(rows)
    }

    /// Close a group membership's validity window now (the row is kept)
    pub fn expire_actor_group(&self, actor_id: i64, group_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE actor_group_memberships SET valid_until = ?3
                WHERE actor_id = ?1 AND group_id = ?2 AND valid_until IS NULL
                "#,
                params![actor_id, group_id, now_str()],
            )
            .map_err(|e| Error::Storage(format!("Failed to expire membership: {}", e)))?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Query Log
    // ========================================================================

    /// Number of query log rows written for a job
    pub fn count_query_logs(&self, job_id: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM query_logs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to count query logs: {}", e)))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `f` inside one transaction; any error rolls every write back
    pub fn with_transaction<T>(&self, f: impl FnOnce(&PolicyWriter<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

        let value = {
            let writer = PolicyWriter { tx: &tx };
            f(&writer)?
        };

        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }
}

/// Write handle scoped to one open transaction
pub struct PolicyWriter<'a> {
    tx: &'a Transaction<'a>,
}

impl PolicyWriter<'_> {
    /// Drop every discovered policy of a connection (manual ones stay)
    pub fn delete_discovered_policies(&self, connection_id: i64) -> Result<usize> {
        self.tx
            .execute(
                "DELETE FROM policies WHERE connection_id = ?1 AND source = 'discovered'",
                params![connection_id],
            )
            .map_err(|e| Error::Storage(format!("Failed to delete policies: {}", e)))
    }

    /// Insert a policy; returns false when an equivalent record already exists
    pub fn insert_policy(&self, record: &PolicyRecord) -> Result<bool> {
        let changed = self
            .tx
            .execute(
                r#"
                INSERT OR IGNORE INTO policies
                    (connection_id, actor_id, database_id, object_id, template_id,
                     enabled, source, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.connection_id,
                    record.actor_id,
                    record.database_id,
                    record.object_id,
                    record.template_id,
                    record.enabled,
                    record.source.as_str(),
                    now_str(),
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to insert policy: {}", e)))?;
        Ok(changed > 0)
    }

    /// Insert or flip the enabled flag of a policy; the record's source wins
    pub fn upsert_policy_status(&self, record: &PolicyRecord) -> Result<()> {
        self.tx
            .execute(
                r#"
                INSERT INTO policies
                    (connection_id, actor_id, database_id, object_id, template_id,
                     enabled, source, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (connection_id, actor_id, database_id, object_id, template_id)
                DO UPDATE SET enabled = excluded.enabled, source = excluded.source
                "#,
                params![
                    record.connection_id,
                    record.actor_id,
                    record.database_id,
                    record.object_id,
                    record.template_id,
                    record.enabled,
                    record.source.as_str(),
                    now_str(),
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to update policy: {}", e)))?;
        Ok(())
    }

    /// Add actor to a group; an active membership is left untouched, a lapsed one re-opens
    pub fn insert_actor_group(&self, actor_id: i64, group_id: i64) -> Result<bool> {
        self.open_membership("actor_group_memberships", "group_id", actor_id, group_id)
    }

    /// Add actor to a Group-List Policy; same rules as `insert_actor_group`
    pub fn insert_actor_policy(&self, actor_id: i64, policy_id: i64) -> Result<bool> {
        self.open_membership("actor_policy_memberships", "policy_id", actor_id, policy_id)
    }

    /// Returns true when a membership was created or re-opened
    fn open_membership(
        &self,
        table: &str,
        target_column: &str,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO {table} (actor_id, {col}, valid_from) VALUES (?1, ?2, ?3)
            ON CONFLICT (actor_id, {col}) DO UPDATE
                SET valid_from = excluded.valid_from, valid_until = NULL
                WHERE valid_until IS NOT NULL AND valid_until <= excluded.valid_from
            "#,
            table = table,
            col = target_column
        );
        let changed = self
            .tx
            .execute(&sql, params![actor_id, target_id, now_str()])
            .map_err(|e| {
                Error::Storage(format!("Failed to open membership in {}: {}", table, e))
            })?;
        Ok(changed > 0)
    }

    /// Record one executed probe
    pub fn insert_query_log(&self, record: &QueryLogRecord) -> Result<()> {
        self.tx
            .execute(
                r#"
                INSERT INTO query_logs
                    (job_id, template_id, actor_id, database_id, object_id, query_text,
                     verdict, error_message, duration_ms, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    record.job_id,
                    record.template_id,
                    record.actor_id,
                    record.database_id,
                    record.object_id,
                    record.query_text,
                    record.verdict,
                    record.error_message,
                    record.duration_ms,
                    now_str(),
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to insert query log: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Remote database connection (endpoint + agent)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: i64,
    /// Database family (`mysql`, `oracle`)
    pub family: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Oracle service name / default schema
    #[serde(default)]
    pub service_name: Option<String>,
    /// Remote agent that executes commands for this connection
    pub agent_id: String,
}

/// Database account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub id: i64,
    pub connection_id: i64,
    pub user: String,
    pub host: String,
}

impl ActorRecord {
    /// `user@host` identity
    pub fn identity(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub id: i64,
    pub connection_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: i64,
    pub database_id: i64,
    pub name: String,
    pub object_type_id: i64,
}

/// Stored probe template (definition still encoded)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: i64,
    pub family: String,
    pub action_id: i64,
    #[serde(default)]
    pub object_type_id: i64,
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupListPolicyRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub template_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub required_policy_ids: Vec<i64>,
}

/// Where a policy came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Discovered,
    Manual,
}

impl PolicySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicySource::Discovered => "discovered",
            PolicySource::Manual => "manual",
        }
    }

    fn from_str_lossy(s: &str) -> Self {
        match s {
            "manual" => PolicySource::Manual,
            _ => PolicySource::Discovered,
        }
    }
}

/// Grant record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: Option<i64>,
    pub connection_id: i64,
    pub actor_id: i64,
    pub database_id: i64,
    pub object_id: i64,
    pub template_id: i64,
    pub enabled: bool,
    pub source: PolicySource,
    pub created_at: Option<String>,
}

impl PolicyRecord {
    pub fn discovered(
        connection_id: i64,
        actor_id: i64,
        database_id: i64,
        object_id: i64,
        template_id: i64,
    ) -> Self {
        Self {
            id: None,
            connection_id,
            actor_id,
            database_id,
            object_id,
            template_id,
            enabled: true,
            source: PolicySource::Discovered,
            created_at: None,
        }
    }
}

/// Membership with validity window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub actor_id: i64,
    /// Group id or Group-List Policy id depending on the table
    pub target_id: i64,
    pub valid_from: String,
    pub valid_until: Option<String>,
}

/// One executed probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogRecord {
    pub job_id: String,
    pub template_id: i64,
    pub actor_id: i64,
    pub database_id: i64,
    pub object_id: i64,
    pub query_text: String,
    pub verdict: String,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}
