//! Job definition and types

use crate::handler::HandlerKind;
use crate::state::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Generate a new job id
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Remote task tracked by a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRef {
    /// Agent executing the task
    pub agent_id: String,

    /// Task id returned by the agent
    pub remote_task_id: String,
}

impl TransportRef {
    pub fn new(agent_id: impl Into<String>, remote_task_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            remote_task_id: remote_task_id.into(),
        }
    }
}

/// A tracked unit of asynchronous work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: String,

    /// Owning scope (connection / database id), absent for system jobs
    pub scope: Option<i64>,

    /// Remote task reference (absent for master / synchronous jobs)
    pub transport: Option<TransportRef>,

    /// Current state
    pub status: JobStatus,

    /// Progress percentage (0-100)
    pub progress: u8,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Human readable message
    pub message: String,

    /// Sub-unit counts
    pub completed: u32,
    pub failed: u32,
    pub total: u32,

    /// Last error text
    pub error: Option<String>,

    /// Result payload: object (merged sections) or array (ordered steps)
    pub results: Value,

    /// Completion handler tag
    pub handler: Option<HandlerKind>,

    /// Context bag consumed by the handler
    pub context: HashMap<String, Value>,

    /// Resolved out-of-band (or not a remote task): skip polling
    pub resolved: bool,

    /// Completion handler already dispatched
    pub handler_dispatched: bool,

    /// Master job id for sub-jobs
    pub parent: Option<String>,

    /// Sub-job ids for master jobs
    pub sub_jobs: Vec<String>,
}

impl Job {
    pub(crate) fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: spec.id,
            scope: spec.scope,
            transport: spec.transport,
            status: JobStatus::Running,
            progress: 0,
            started_at: Utc::now(),
            ended_at: None,
            message: spec.message,
            completed: 0,
            failed: 0,
            total: 0,
            error: None,
            results: Value::Null,
            handler: spec.handler,
            context: spec.context,
            resolved: false,
            handler_dispatched: false,
            parent: None,
            sub_jobs: Vec::new(),
        }
    }

    /// Whether the polling loop still has to look at this job
    pub fn needs_polling(&self) -> bool {
        !self.resolved && self.status == JobStatus::Running && self.transport.is_some()
    }

    /// Context value as string
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// Context value as i64
    pub fn context_i64(&self, key: &str) -> Option<i64> {
        self.context.get(key).and_then(Value::as_i64)
    }

    /// Get execution duration
    pub fn duration(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }
}

/// Registration parameters for a job
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub id: String,
    pub scope: Option<i64>,
    pub transport: Option<TransportRef>,
    pub handler: Option<HandlerKind>,
    pub context: HashMap<String, Value>,
    pub message: String,
}

impl JobSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn scope(mut self, scope: i64) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn transport(mut self, agent_id: impl Into<String>, remote_task_id: impl Into<String>) -> Self {
        self.transport = Some(TransportRef::new(agent_id, remote_task_id));
        self
    }

    pub fn handler(mut self, handler: HandlerKind) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// One page of jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Default page / page size used for invalid paging input
pub const DEFAULT_PAGE: usize = 1;
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Invalid (non-positive) paging input falls back to 1 / 10
pub fn normalize_paging(page: i64, page_size: i64) -> (usize, usize) {
    let page = usize::try_from(page)
        .ok()
        .filter(|p| *p >= 1)
        .unwrap_or(DEFAULT_PAGE);
    let page_size = usize::try_from(page_size)
        .ok()
        .filter(|s| *s >= 1)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    (page, page_size)
}
