//! Job state machine
//!
//! ```text
//! running ──► processing ──► completed | failed
//!    │
//!    ├──► completed | failed   (no handler)
//!    └──► error                (transport / parse failure)
//! ```

use serde::{Deserialize, Serialize};

/// Possible states of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Remote task in flight
    Running,

    /// Remote side finished, completion handler still working
    Processing,

    /// Job completed successfully
    Completed,

    /// Business failure (remote reported failure or handler failed)
    Failed,

    /// Transport or parse failure while tracking the job
    Error,
}

impl JobStatus {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Error
        )
    }

    /// Check if job is still being worked on
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Processing)
    }

    /// Check if job completed successfully
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
