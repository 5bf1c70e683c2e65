//! Database families and their mirrored privilege catalog
//!
//! 모든 컬럼은 TEXT: vendor별 값 형식을 그대로 받아들인다.

use dbguard_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved super-privilege template for MySQL
pub const MYSQL_SUPER_TEMPLATE_ID: i64 = 1;

/// Reserved super-privilege template for Oracle
pub const ORACLE_SUPER_TEMPLATE_ID: i64 = 2;

/// Reserved group receiving every super-privileged actor
pub const SUPER_GROUP_ID: i64 = 1;

/// Object type id matching every object type
pub const WILDCARD_OBJECT_TYPE: i64 = 0;

/// Supported database family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbFamily {
    MySql,
    Oracle,
}

impl DbFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbFamily::MySql => "mysql",
            DbFamily::Oracle => "oracle",
        }
    }

    /// Template id that grants everything for this family
    pub fn super_template_id(&self) -> i64 {
        match self {
            DbFamily::MySql => MYSQL_SUPER_TEMPLATE_ID,
            DbFamily::Oracle => ORACLE_SUPER_TEMPLATE_ID,
        }
    }

    /// Mirrored catalog tables
    pub fn tables(&self) -> &'static [MirrorTable] {
        match self {
            DbFamily::MySql => MYSQL_TABLES,
            DbFamily::Oracle => ORACLE_TABLES,
        }
    }

    /// Schema the tables live in (`mysql.user`), attached to the session
    pub fn attached_schema(&self) -> Option<&'static str> {
        match self {
            DbFamily::MySql => Some("mysql"),
            DbFamily::Oracle => None,
        }
    }

    /// Look up a mirror table by (case-insensitive, unquoted) name
    pub fn table(&self, name: &str) -> Option<&'static MirrorTable> {
        let wanted = normalize_table_name(name);
        self.tables()
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(&wanted))
    }

    /// Whether query text references at least one mirrored table
    pub fn references_catalog(&self, query: &str) -> bool {
        let lower = query.to_ascii_lowercase();
        self.tables()
            .iter()
            .any(|t| references_table(&lower, &t.name.to_ascii_lowercase()))
    }

    /// `CREATE TABLE` statements for the mirror schema
    pub fn create_statements(&self) -> Vec<String> {
        self.tables()
            .iter()
            .map(|t| {
                let columns = t
                    .columns
                    .iter()
                    .map(|c| format!("\"{}\" TEXT", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("CREATE TABLE IF NOT EXISTS {} ({})", t.name, columns)
            })
            .collect()
    }
}

impl fmt::Display for DbFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DbFamily::MySql),
            "oracle" => Ok(DbFamily::Oracle),
            other => Err(Error::NotImplemented(format!(
                "Database family '{}' is not supported",
                other
            ))),
        }
    }
}

/// One mirrored catalog table with its fixed column order
#[derive(Debug)]
pub struct MirrorTable {
    /// Qualified name as templates reference it
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

impl MirrorTable {
    /// Remote query dumping this table in column order
    pub fn dump_query(&self) -> String {
        format!("SELECT {} FROM {}", self.columns.join(", "), self.name)
    }

    pub fn insert_statement(&self) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} VALUES ({})", self.name, placeholders)
    }
}

/// Strip quoting and surrounding whitespace from a table name
pub fn normalize_table_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '\'' | '[' | ']'))
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Whole-word occurrence of `table` in lowercased query text
fn references_table(query: &str, table: &str) -> bool {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    query.match_indices(table).any(|(start, _)| {
        let before = query[..start].chars().next_back();
        let after = query[start + table.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

// ============================================================================
// MySQL
// ============================================================================

const MYSQL_TABLES: &[MirrorTable] = &[
    MirrorTable {
        name: "mysql.user",
        columns: &[
            "Host",
            "User",
            "Select_priv",
            "Insert_priv",
            "Update_priv",
            "Delete_priv",
            "Create_priv",
            "Drop_priv",
            "Reload_priv",
            "Shutdown_priv",
            "Process_priv",
            "File_priv",
            "Grant_priv",
            "Alter_priv",
            "Show_db_priv",
            "Super_priv",
            "Execute_priv",
            "Create_user_priv",
            "account_locked",
        ],
    },
    MirrorTable {
        name: "mysql.db",
        columns: &[
            "Host",
            "Db",
            "User",
            "Select_priv",
            "Insert_priv",
            "Update_priv",
            "Delete_priv",
            "Create_priv",
            "Drop_priv",
            "Grant_priv",
            "Alter_priv",
            "Execute_priv",
        ],
    },
    MirrorTable {
        name: "mysql.tables_priv",
        columns: &[
            "Host",
            "Db",
            "User",
            "Table_name",
            "Grantor",
            "Timestamp",
            "Table_priv",
            "Column_priv",
        ],
    },
    MirrorTable {
        name: "mysql.columns_priv",
        columns: &[
            "Host",
            "Db",
            "User",
            "Table_name",
            "Column_name",
            "Timestamp",
            "Column_priv",
        ],
    },
    MirrorTable {
        name: "mysql.procs_priv",
        columns: &[
            "Host",
            "Db",
            "User",
            "Routine_name",
            "Routine_type",
            "Grantor",
            "Proc_priv",
            "Timestamp",
        ],
    },
    MirrorTable {
        name: "mysql.global_grants",
        columns: &["USER", "HOST", "PRIV", "WITH_GRANT_OPTION"],
    },
    MirrorTable {
        name: "mysql.role_edges",
        columns: &[
            "FROM_HOST",
            "FROM_USER",
            "TO_HOST",
            "TO_USER",
            "WITH_ADMIN_OPTION",
        ],
    },
];

// ============================================================================
// Oracle
// ============================================================================

const ORACLE_TABLES: &[MirrorTable] = &[
    MirrorTable {
        name: "DBA_USERS",
        columns: &[
            "USERNAME",
            "USER_ID",
            "ACCOUNT_STATUS",
            "DEFAULT_TABLESPACE",
            "CREATED",
        ],
    },
    MirrorTable {
        name: "DBA_SYS_PRIVS",
        columns: &["GRANTEE", "PRIVILEGE", "ADMIN_OPTION", "COMMON", "INHERITED"],
    },
    MirrorTable {
        name: "DBA_TAB_PRIVS",
        columns: &[
            "GRANTEE",
            "OWNER",
            "TABLE_NAME",
            "GRANTOR",
            "PRIVILEGE",
            "GRANTABLE",
            "HIERARCHY",
            "COMMON",
            "TYPE",
            "INHERITED",
        ],
    },
    MirrorTable {
        name: "DBA_COL_PRIVS",
        columns: &[
            "GRANTEE",
            "OWNER",
            "TABLE_NAME",
            "COLUMN_NAME",
            "GRANTOR",
            "PRIVILEGE",
            "GRANTABLE",
        ],
    },
    MirrorTable {
        name: "DBA_ROLE_PRIVS",
        columns: &[
            "GRANTEE",
            "GRANTED_ROLE",
            "ADMIN_OPTION",
            "DELEGATE_OPTION",
            "DEFAULT_ROLE",
            "COMMON",
            "INHERITED",
        ],
    },
];
