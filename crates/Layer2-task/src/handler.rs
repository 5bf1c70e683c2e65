//! Completion handlers
//!
//! Job에는 handler 함수 대신 직렬화 가능한 tag (`HandlerKind`)만 저장하고,
//! 실제 구현은 `HandlerRegistry`에서 조회한다.

use crate::composite::CompositeHandler;
use crate::job::Job;
use crate::registry::JobRegistry;
use async_trait::async_trait;
use dbguard_foundation::{RemoteStatus, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handler tag stored on a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Evaluate a privilege snapshot and synthesize policies
    PrivilegeDiscovery,

    /// Aggregate sub-job outcomes of a master job
    Composite,

    /// Externally registered handler
    Custom(String),
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::PrivilegeDiscovery => write!(f, "privilege_discovery"),
            HandlerKind::Composite => write!(f, "composite"),
            HandlerKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Work run once a job's remote side has finished
///
/// Returning `Ok` completes the job and `Err` fails it, unless the handler
/// already finished the job itself through the registry.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn handle(&self, jobs: &JobRegistry, job: &Job, status: &RemoteStatus) -> Result<()>;
}

/// Maps handler tags to implementations
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<HandlerKind, Arc<dyn CompletionHandler>>>>,
}

impl HandlerRegistry {
    /// Registry with the built-in composite handler
    pub fn new() -> Self {
        let registry = Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        };
        registry.register(HandlerKind::Composite, Arc::new(CompositeHandler));
        registry
    }

    pub fn with(self, kind: HandlerKind, handler: Arc<dyn CompletionHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn register(&self, kind: HandlerKind, handler: Arc<dyn CompletionHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    pub fn get(&self, kind: &HandlerKind) -> Option<Arc<dyn CompletionHandler>> {
        self.handlers.read().get(kind).cloned()
    }

    pub fn contains(&self, kind: &HandlerKind) -> bool {
        self.handlers.read().contains_key(kind)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl CompletionHandler for Noop {
        async fn handle(&self, _jobs: &JobRegistry, _job: &Job, _status: &RemoteStatus) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_composite_is_builtin() {
        let registry = HandlerRegistry::new();
        assert!(registry.contains(&HandlerKind::Composite));
        assert!(!registry.contains(&HandlerKind::PrivilegeDiscovery));
    }

    #[test]
    fn test_custom_registration() {
        let registry =
            HandlerRegistry::new().with(HandlerKind::Custom("backup".into()), Arc::new(Noop));
        assert!(registry.get(&HandlerKind::Custom("backup".into())).is_some());
        assert_eq!(HandlerKind::Custom("backup".into()).to_string(), "custom:backup");
    }

    #[test]
    fn test_kind_serializes_as_tag() {
        let json = serde_json::to_string(&HandlerKind::PrivilegeDiscovery).unwrap();
        assert_eq!(json, "\"privilege_discovery\"");
    }
}
