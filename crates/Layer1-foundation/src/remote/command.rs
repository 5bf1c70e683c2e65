//! Remote command codec
//!
//! 명령은 JSON 직렬화 후 hex 인코딩되어 전송된다.
//! SQL 본문에 어떤 구분자가 들어 있어도 framing이 깨지지 않는다.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 실행 옵션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOption {
    /// 출력 즉시 반환
    #[default]
    Sync,
    /// 원격 task id 반환, 상태는 별도 조회
    Background,
}

/// 원격 agent에 전달되는 명령
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Target database / service name
    #[serde(default)]
    pub database: String,
    /// Query or command text
    pub query: String,
    /// Action tag (`privilege_dump`, `policy_grant`, `status`, ...)
    pub action: String,
    #[serde(default)]
    pub option: ExecutionOption,
}

impl RemoteCommand {
    pub fn new(
        db_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        action: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            db_type: db_type.into(),
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            query: query.into(),
            action: action.into(),
            option: ExecutionOption::Sync,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn background(mut self) -> Self {
        self.option = ExecutionOption::Background;
        self
    }

    /// JSON → hex
    pub fn encode(&self) -> Result<EncodedCommand> {
        let json = serde_json::to_vec(self)?;
        Ok(EncodedCommand(hex::encode(json)))
    }
}

/// Hex encoded command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand(String);

impl EncodedCommand {
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// hex → JSON → command
    pub fn decode(&self) -> Result<RemoteCommand> {
        let bytes = hex::decode(&self.0)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Parse(format!("Invalid command payload: {}", e)))
    }
}

impl fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Status payload
// ============================================================================

/// 원격 background task 상태 응답
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: String,
    /// Agents report floats or out-of-range values; clamped to 0..=100
    #[serde(default, deserialize_with = "lenient_progress")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub completed: Option<u32>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub failed: Option<u32>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total: Option<u32>,
    /// Object (named sections) or array (ordered steps)
    #[serde(default)]
    pub results: Option<Value>,
    #[serde(default)]
    pub result_file: Option<String>,
}

/// Numeric field as f64: JSON numbers and numeric strings, anything else is absent
fn loose_number(value: Option<Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn lenient_progress<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(loose_number(value).map(|n| n.round().clamp(0.0, 100.0) as u8))
}

fn lenient_count<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(loose_number(value).map(|n| n.round().clamp(0.0, u32::MAX as f64) as u32))
}

impl RemoteStatus {
    /// Parse a raw status response; malformed payloads are parse errors
    pub fn parse(raw: &str) -> Result<Self> {
        let status: RemoteStatus = serde_json::from_str(raw.trim())
            .map_err(|e| Error::Parse(format!("Invalid status payload: {}", e)))?;
        if status.status.is_empty() {
            return Err(Error::Parse("Status payload has no status field".to_string()));
        }
        Ok(status)
    }

    /// Remote side finished (either way)
    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "completed" | "success"
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "failed" | "error")
    }
}

/// Synchronous command output (`{"status": "success", ...}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl CommandOutput {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw.trim())
            .map_err(|e| Error::Parse(format!("Invalid command output: {}", e)))
    }

    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_with_delimiters_survives() {
        let cmd = RemoteCommand::new(
            "mysql",
            "db1",
            3306,
            "privilege_dump",
            "SELECT '|;#[0]' AS \"x\"\n, '\\' FROM mysql.user",
        )
        .with_credentials("admin", "p@ss:word")
        .background();

        let encoded = cmd.encode().unwrap();
        assert!(encoded.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(encoded.decode().unwrap(), cmd);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            EncodedCommand::from_hex("zz").decode(),
            Err(Error::Hex(_))
        ));
        assert!(matches!(
            EncodedCommand::from_hex(hex::encode("not json")).decode(),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_status_parse() {
        let status = RemoteStatus::parse(
            r#"{"status": "completed", "progress": 100, "completed": 3, "total": 3,
                "result_file": "dump.json"}"#,
        )
        .unwrap();
        assert!(status.is_terminal());
        assert!(status.is_success());
        assert_eq!(status.result_file.as_deref(), Some("dump.json"));

        let running = RemoteStatus::parse(r#"{"status": "running", "progress": 40}"#).unwrap();
        assert!(!running.is_terminal());

        assert!(RemoteStatus::parse("<html>").is_err());
        assert!(RemoteStatus::parse(r#"{"progress": 1}"#).is_err());
    }

    #[test]
    fn test_status_numbers_are_lenient() {
        let progress = |raw: &str| RemoteStatus::parse(raw).unwrap().progress;
        assert_eq!(progress(r#"{"status": "running", "progress": 42.5}"#), Some(43));
        assert_eq!(progress(r#"{"status": "running", "progress": -1}"#), Some(0));
        assert_eq!(progress(r#"{"status": "running", "progress": 250}"#), Some(100));
        assert_eq!(progress(r#"{"status": "running", "progress": "70"}"#), Some(70));
        assert_eq!(progress(r#"{"status": "running", "progress": null}"#), None);

        let counts = RemoteStatus::parse(
            r#"{"status": "running", "completed": 2.0, "failed": -3, "total": "5"}"#,
        )
        .unwrap();
        assert_eq!(
            (counts.completed, counts.failed, counts.total),
            (Some(2), Some(0), Some(5))
        );
    }
}
