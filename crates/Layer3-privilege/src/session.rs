//! Privilege Session - embedded engine for one discovery run
//!
//! 고유한 shared-cache in-memory SQLite DB를 하나 띄우고 (ephemeral endpoint),
//! family별 mirror schema를 만든 뒤 snapshot을 적재한다.
//! Worker는 `handle()`로 같은 엔진에 자기 connection을 연다.

use crate::schema::DbFamily;
use crate::snapshot::Snapshot;
use crate::template::{substitute, TemplateVars};
use dbguard_foundation::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result rows as text cells
pub type Rows = Vec<Vec<Option<String>>>;

/// Default liveness wait
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Embedded engine instance scoped to one discovery run
pub struct PrivilegeSession {
    family: DbFamily,
    endpoint: Endpoint,
    /// Keeps the in-memory database alive; `None` once closed
    owner: Mutex<Option<Connection>>,
}

/// Where handles connect to
#[derive(Debug, Clone)]
struct Endpoint {
    main_uri: String,
    attached: Option<(String, &'static str)>,
}

impl Endpoint {
    fn new(family: DbFamily) -> Self {
        let name = format!("dbguard-session-{}", Uuid::new_v4().simple());
        Self {
            main_uri: format!("file:{}?mode=memory&cache=shared", name),
            attached: family.attached_schema().map(|schema| {
                (
                    format!("file:{}-{}?mode=memory&cache=shared", name, schema),
                    schema,
                )
            }),
        }
    }

    fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.main_uri, flags)
            .map_err(|e| Error::Engine(format!("Failed to open session endpoint: {}", e)))?;

        if let Some((uri, schema)) = &self.attached {
            conn.execute(&format!("ATTACH DATABASE ?1 AS {}", schema), [uri])
                .map_err(|e| Error::Engine(format!("Failed to attach schema {}: {}", schema, e)))?;
        }
        Ok(conn)
    }
}

impl PrivilegeSession {
    /// Boot the engine and wait until it answers a liveness probe
    pub async fn start(family: DbFamily, startup_timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::new(family);
        let boot_endpoint = endpoint.clone();
        let boot = tokio::task::spawn_blocking(move || boot_engine(family, &boot_endpoint));

        let owner = tokio::time::timeout(startup_timeout, boot)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "Privilege session did not become ready within {:?}",
                    startup_timeout
                ))
            })?
            .map_err(|e| Error::Engine(format!("Session startup task failed: {}", e)))??;

        info!(family = %family, endpoint = %endpoint.main_uri, "Privilege session ready");
        Ok(Self {
            family,
            endpoint,
            owner: Mutex::new(Some(owner)),
        })
    }

    pub fn family(&self) -> DbFamily {
        self.family
    }

    pub fn is_closed(&self) -> bool {
        self.owner.lock().is_none()
    }

    /// Liveness probe against the running engine
    pub fn is_alive(&self) -> bool {
        let guard = self.owner.lock();
        match guard.as_ref() {
            Some(conn) => liveness(conn).is_ok(),
            None => false,
        }
    }

    /// Open a read handle for one worker
    pub fn handle(&self) -> Result<SessionHandle> {
        if self.is_closed() {
            return Err(Error::Engine("Privilege session is closed".to_string()));
        }
        let conn = self.endpoint.connect()?;
        conn.execute_batch("PRAGMA read_uncommitted = 1;")
            .map_err(|e| Error::Engine(format!("Failed to configure handle: {}", e)))?;
        Ok(SessionHandle { conn })
    }

    /// Substitute placeholders and run a probe
    pub fn execute_template(&self, sql: &str, vars: &TemplateVars) -> Result<Rows> {
        let sql = substitute(sql, vars);
        let guard = self.owner.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Engine("Privilege session is closed".to_string()))?;
        query_rows(conn, &sql)
    }

    /// Rows currently loaded into a mirror table
    pub fn row_count(&self, table: &str) -> Result<i64> {
        let table = self
            .family
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("Mirror table {}", table)))?;
        let guard = self.owner.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Engine("Privilege session is closed".to_string()))?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name), [], |row| {
            row.get(0)
        })
        .map_err(|e| Error::Engine(format!("Failed to count {}: {}", table.name, e)))
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load a snapshot; each entry is loaded (or dropped) on its own
    pub fn load_snapshot(&self, snapshot: &Snapshot) -> Result<LoadReport> {
        let mut guard = self.owner.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Engine("Privilege session is closed".to_string()))?;

        let mut report = LoadReport::default();
        for entry in &snapshot.entries {
            if !entry.is_success() {
                debug!(key = %entry.query_key, status = %entry.status, "Skipping failed dump entry");
                report.skipped_entries += 1;
                continue;
            }

            let key = match entry.key() {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping snapshot entry: {}", e);
                    report.failed.push((entry.query_key.clone(), e.to_string()));
                    continue;
                }
            };

            let Some(table) = self.family.table(&key.table) else {
                warn!("Snapshot table {} is not mirrored for {}", key.table, self.family);
                report
                    .failed
                    .push((key.table.clone(), "unknown table".to_string()));
                continue;
            };

            let rows = entry.text_rows();
            let width = table.columns.len();
            let insert = table.insert_statement();

            let loaded = (|| -> rusqlite::Result<usize> {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&insert)?;
                    for row in &rows {
                        let mut cells = row.clone();
                        cells.resize(width, None);
                        stmt.execute(params_from_iter(cells.iter()))?;
                    }
                }
                tx.commit()?;
                Ok(rows.len())
            })();

            match loaded {
                Ok(n) => *report.rows.entry(table.name.to_string()).or_default() += n,
                Err(e) => {
                    warn!("Failed to load {} into session: {}", table.name, e);
                    report.failed.push((table.name.to_string(), e.to_string()));
                }
            }
        }

        info!(
            "Snapshot loaded: {} rows in {} tables ({} skipped, {} failed)",
            report.total_rows(),
            report.rows.len(),
            report.skipped_entries,
            report.failed.len()
        );
        Ok(report)
    }

    /// Tear down; safe to call more than once
    pub fn close(&self) {
        if let Some(conn) = self.owner.lock().take() {
            if let Err((_, e)) = conn.close() {
                warn!("Privilege session close reported: {}", e);
            }
            debug!(endpoint = %self.endpoint.main_uri, "Privilege session closed");
        }
    }
}

impl Drop for PrivilegeSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker-owned connection to a session
pub struct SessionHandle {
    conn: Connection,
}

impl SessionHandle {
    pub fn query(&self, sql: &str) -> Result<Rows> {
        query_rows(&self.conn, sql)
    }
}

/// Per-table load outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Rows inserted per mirror table
    pub rows: BTreeMap<String, usize>,
    /// Entries skipped because the dump query itself failed
    pub skipped_entries: usize,
    /// (table or key, reason) for entries that could not be loaded
    pub failed: Vec<(String, String)>,
}

impl LoadReport {
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

fn boot_engine(family: DbFamily, endpoint: &Endpoint) -> Result<Connection> {
    let conn = endpoint.connect()?;
    for statement in family.create_statements() {
        conn.execute(&statement, [])
            .map_err(|e| Error::Engine(format!("Failed to create mirror schema: {}", e)))?;
    }
    liveness(&conn)?;
    Ok(conn)
}

fn liveness(conn: &Connection) -> Result<()> {
    let one: i64 = conn
        .query_row("SELECT 1", [], |row| row.get(0))
        .map_err(|e| Error::Engine(format!("Liveness probe failed: {}", e)))?;
    if one == 1 {
        Ok(())
    } else {
        Err(Error::Engine("Liveness probe returned an unexpected value".to_string()))
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<Rows> {
    let engine_err = |e: rusqlite::Error| Error::Engine(e.to_string());

    let mut stmt = conn.prepare(sql).map_err(engine_err)?;
    let width = stmt.column_count();
    let mut rows = stmt.query([]).map_err(engine_err)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(engine_err)? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(cell_text(row.get_ref(i).map_err(engine_err)?));
        }
        out.push(cells);
    }
    Ok(out)
}

fn cell_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VAR_USER;

    fn snapshot(json: &str) -> Snapshot {
        Snapshot::parse(json.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_query_attached_schema() {
        let session = PrivilegeSession::start(DbFamily::MySql, DEFAULT_STARTUP_TIMEOUT)
            .await
            .unwrap();
        assert!(session.is_alive());

        let report = session
            .load_snapshot(&snapshot(
                r#"[{"query_key": "mysql.user||[0]", "result": [["%", "root", "Y"]]}]"#,
            ))
            .unwrap();
        assert_eq!(report.rows.get("mysql.user"), Some(&1));

        let vars = TemplateVars::new().set(VAR_USER, "root");
        let rows = session
            .execute_template(
                "SELECT Select_priv, Super_priv FROM mysql.user WHERE User = '${user}'",
                &vars,
            )
            .unwrap();
        // short rows are NULL padded
        assert_eq!(rows, vec![vec![Some("Y".to_string()), None]]);
    }

    #[tokio::test]
    async fn test_load_is_best_effort_per_table() {
        let session = PrivilegeSession::start(DbFamily::Oracle, DEFAULT_STARTUP_TIMEOUT)
            .await
            .unwrap();
        let report = session
            .load_snapshot(&snapshot(
                r#"[
                    {"key": "DBA_SYS_PRIVS", "rows": [["APP", "CREATE SESSION", "NO", "NO", "NO", "extra"]]},
                    {"key": "DBA_NOT_MIRRORED", "rows": [["x"]]},
                    {"key": "DBA_ROLE_PRIVS", "status": "error", "rows": []},
                    {"key": "DBA_USERS#0", "rows": [["APP", "101"]]}
                ]"#,
            ))
            .unwrap();

        assert_eq!(report.total_rows(), 2);
        assert_eq!(report.skipped_entries, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(session.row_count("dba_sys_privs").unwrap(), 1);
        assert_eq!(session.row_count("DBA_USERS").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handles_see_loaded_data() {
        let session = PrivilegeSession::start(DbFamily::MySql, DEFAULT_STARTUP_TIMEOUT)
            .await
            .unwrap();
        session
            .load_snapshot(&snapshot(
                r#"[{"key": "mysql.db", "rows": [["%", "sales", "app", "Y"]]}]"#,
            ))
            .unwrap();

        let handle = session.handle().unwrap();
        let rows = handle
            .query("SELECT Db FROM mysql.db WHERE User = 'app'")
            .unwrap();
        assert_eq!(rows[0][0].as_deref(), Some("sales"));
        assert!(handle.query("SELECT * FROM missing_table").is_err());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let a = PrivilegeSession::start(DbFamily::MySql, DEFAULT_STARTUP_TIMEOUT)
            .await
            .unwrap();
        let b = PrivilegeSession::start(DbFamily::MySql, DEFAULT_STARTUP_TIMEOUT)
            .await
            .unwrap();
        a.load_snapshot(&snapshot(r#"[{"key": "mysql.user", "rows": [["%", "root"]]}]"#))
            .unwrap();
        assert_eq!(a.row_count("mysql.user").unwrap(), 1);
        assert_eq!(b.row_count("mysql.user").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = PrivilegeSession::start(DbFamily::MySql, DEFAULT_STARTUP_TIMEOUT)
            .await
            .unwrap();
        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(!session.is_alive());
        assert!(session.handle().is_err());
        assert!(session
            .execute_template("SELECT 1", &TemplateVars::new())
            .is_err());
    }
}
