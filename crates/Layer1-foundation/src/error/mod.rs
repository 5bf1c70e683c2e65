//! Error types for dbguard
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// dbguard 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // 원격 실행 관련
    // ========================================================================
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote error: {agent} - {message}")]
    Remote { agent: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    // ========================================================================
    // Job 관련
    // ========================================================================
    #[error("Job {job_id} (scope {scope}): {message}")]
    Job {
        job_id: String,
        scope: String,
        message: String,
    },

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Job already processed: {0}")]
    AlreadyProcessed(String),

    // ========================================================================
    // 권한 평가 관련
    // ========================================================================
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Template error: {template_id} - {message}")]
    Template { template_id: i64, message: String },

    #[error("Bulk policy update failed: {failed} of {total} commands did not succeed")]
    BulkUpdateFailed { failed: usize, total: usize },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transport(_) | Error::Io(_))
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::InvalidInput(_)
                | Error::Validation(_)
                | Error::BulkUpdateFailed { .. }
                | Error::AlreadyProcessed(_)
        )
    }

    /// Remote 에러 생성 헬퍼
    pub fn remote(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Template 에러 생성 헬퍼
    pub fn template(template_id: i64, message: impl Into<String>) -> Self {
        Error::Template {
            template_id,
            message: message.into(),
        }
    }

    /// Wrap with job/scope context at a layer boundary.
    ///
    /// Already-wrapped errors keep their original context.
    pub fn in_job(self, job_id: &str, scope: Option<i64>) -> Self {
        match self {
            e @ Error::Job { .. } => e,
            other => Error::Job {
                job_id: job_id.to_string(),
                scope: scope.map_or_else(|| "-".to_string(), |s| s.to_string()),
                message: other.to_string(),
            },
        }
    }
}

/// Cut `text` to at most `max` characters, marking the cut with `...`.
pub fn truncate_message(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_job_wraps_once() {
        let err = Error::Transport("connection reset".into()).in_job("job-1", Some(7));
        assert_eq!(
            err.to_string(),
            "Job job-1 (scope 7): Transport error: connection reset"
        );

        let again = err.in_job("job-2", None);
        assert!(again.to_string().starts_with("Job job-1 (scope 7)"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transport("x".into()).is_retryable());
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(!Error::Parse("x".into()).is_retryable());
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 10), "short");
        let long = "a".repeat(250);
        let cut = truncate_message(&long, 200);
        assert_eq!(cut.chars().count(), 200);
        assert!(cut.ends_with("..."));
    }
}
