//! Privilege snapshot file
//!
//! 원격 서버에서 한 번만 읽어온 privilege table dump.
//! JSON 배열: `{query_key, query, status, result, executed_at, duration_ms}`
//!
//! Query key 형식 (두 가지 모두 지원):
//! - legacy: `table[:suffix][#n]` (예: `mysql.tables_priv:sales#2`)
//! - current: `table|object_type|database[n]` (예: `mysql.db|schema|sales[0]`)

use crate::schema::normalize_table_name;
use dbguard_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Parsed query key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    /// Normalized (lowercase, unquoted) table name
    pub table: String,
    pub object_type: Option<String>,
    pub database: Option<String>,
    pub index: Option<usize>,
}

impl QueryKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Parse("Empty query key".to_string()));
        }

        if raw.contains('|') {
            Self::parse_current(raw)
        } else {
            Self::parse_legacy(raw)
        }
    }

    /// `table|object_type|database[n]`
    fn parse_current(raw: &str) -> Result<Self> {
        let (body, index) = split_bracket_index(raw)?;
        let mut parts = body.splitn(3, '|');
        let table = parts.next().unwrap_or_default();
        let object_type = parts.next().and_then(non_empty);
        let database = parts.next().and_then(non_empty);
        Self::build(table, object_type, database, index)
    }

    /// `table[:suffix][#n]`
    fn parse_legacy(raw: &str) -> Result<Self> {
        let (body, index) = match raw.rsplit_once('#') {
            Some((body, n)) => {
                let n = n
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::Parse(format!("Invalid index in query key '{}'", raw)))?;
                (body, Some(n))
            }
            None => (raw, None),
        };
        let (table, suffix) = match body.split_once(':') {
            Some((table, suffix)) => (table, non_empty(suffix)),
            None => (body, None),
        };
        Self::build(table, None, suffix, index)
    }

    fn build(
        table: &str,
        object_type: Option<String>,
        database: Option<String>,
        index: Option<usize>,
    ) -> Result<Self> {
        let table = normalize_table_name(table);
        if table.is_empty() {
            return Err(Error::Parse("Query key has no table name".to_string()));
        }
        Ok(Self {
            table,
            object_type,
            database,
            index,
        })
    }

    /// Render in the current format
    pub fn render(table: &str, object_type: Option<&str>, database: Option<&str>, index: usize) -> String {
        format!(
            "{}|{}|{}[{}]",
            table,
            object_type.unwrap_or_default(),
            database.unwrap_or_default(),
            index
        )
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Split a trailing `[n]`
fn split_bracket_index(raw: &str) -> Result<(&str, Option<usize>)> {
    if let Some(body) = raw.strip_suffix(']') {
        if let Some((body, n)) = body.rsplit_once('[') {
            let n = n
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Parse(format!("Invalid index in query key '{}'", raw)))?;
            return Ok((body, Some(n)));
        }
    }
    Ok((raw, None))
}

/// One dumped query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(alias = "key")]
    pub query_key: String,

    #[serde(default)]
    pub query: String,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default, alias = "rows")]
    pub result: Vec<Vec<Value>>,

    #[serde(default, alias = "timestamp")]
    pub executed_at: Option<String>,

    #[serde(default, alias = "duration")]
    pub duration_ms: Option<u64>,
}

fn default_status() -> String {
    "success".to_string()
}

impl SnapshotEntry {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "success" | "ok" | "completed"
        )
    }

    pub fn key(&self) -> Result<QueryKey> {
        QueryKey::parse(&self.query_key)
    }

    /// Rows as text cells (`NULL` → `None`)
    pub fn text_rows(&self) -> Vec<Vec<Option<String>>> {
        self.result
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect()
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "Y" } else { "N" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Full privilege dump
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Parse(format!("Invalid privilege snapshot: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lowercase hex SHA-256 of a payload
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compare a payload against an expected checksum (case-insensitive)
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Snapshot checksum mismatch: expected {}, got {}",
            expected, actual
        )))
    }
}
