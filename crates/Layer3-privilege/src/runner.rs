//! Probe runner - bounded pool of blocking workers over one session
//!
//! Worker마다 자기 session handle을 열고, 공유 queue에서 task를 꺼내 실행한다.
//! 결과는 mpsc로 모은 뒤 join 이후에 한 번에 drain.

use crate::session::{PrivilegeSession, Rows, SessionHandle};
use dbguard_foundation::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One probe to evaluate
#[derive(Debug, Clone)]
pub struct ProbeTask {
    pub template_id: i64,
    pub action_id: i64,
    pub actor_id: i64,
    pub database_id: i64,
    pub object_id: i64,
    /// Query with placeholders already substituted
    pub query: String,
    /// Set when the probe is known to be unanswerable; it is reported, not run
    pub rejection: Option<String>,
}

impl ProbeTask {
    pub fn reject(mut self, error: Error) -> Self {
        self.rejection = Some(error.to_string());
        self
    }
}

/// Result of one probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub template_id: i64,
    pub action_id: i64,
    pub actor_id: i64,
    pub database_id: i64,
    pub object_id: i64,
    pub query: String,
    pub rows: Rows,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ProbeOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Bounded worker pool
#[derive(Debug, Clone, Copy)]
pub struct ProbeRunner {
    workers: usize,
}

impl ProbeRunner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every task against the session; outcomes come back sorted
    pub async fn run(
        &self,
        session: Arc<PrivilegeSession>,
        tasks: Vec<ProbeTask>,
    ) -> Result<Vec<ProbeOutcome>> {
        self.run_with(session, tasks, |handle, task| handle.query(&task.query))
            .await
    }

    pub(crate) async fn run_with<F>(
        &self,
        session: Arc<PrivilegeSession>,
        tasks: Vec<ProbeTask>,
        probe: F,
    ) -> Result<Vec<ProbeOutcome>>
    where
        F: Fn(&SessionHandle, &ProbeTask) -> Result<Rows> + Send + Sync + 'static,
    {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let total = tasks.len();
        let workers = self.workers.min(total);
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let probe = Arc::new(probe);
        let (tx, mut rx) = mpsc::unbounded_channel();

        debug!("Running {} probes on {} workers", total, workers);

        let mut joins = Vec::with_capacity(workers);
        for worker in 0..workers {
            let session = session.clone();
            let queue = queue.clone();
            let probe = probe.clone();
            let tx = tx.clone();
            joins.push(tokio::task::spawn_blocking(move || {
                run_worker(worker, &session, &queue, probe.as_ref(), &tx)
            }));
        }
        drop(tx);

        for join in joins {
            join.await
                .map_err(|e| Error::Engine(format!("Probe worker failed: {}", e)))?;
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Ok(outcome) = rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| (o.template_id, o.actor_id, o.database_id, o.object_id));
        Ok(outcomes)
    }
}

fn run_worker<F>(
    worker: usize,
    session: &PrivilegeSession,
    queue: &Mutex<VecDeque<ProbeTask>>,
    probe: &F,
    tx: &mpsc::UnboundedSender<ProbeOutcome>,
) where
    F: Fn(&SessionHandle, &ProbeTask) -> Result<Rows>,
{
    let handle = session.handle();
    if let Err(e) = &handle {
        warn!(worker, "Probe worker could not open a session handle: {}", e);
    }

    let mut done = 0usize;
    loop {
        let Some(task) = queue.lock().pop_front() else {
            break;
        };
        let outcome = execute(&handle, task, probe);
        done += 1;
        if tx.send(outcome).is_err() {
            break;
        }
    }
    debug!(worker, done, "Probe worker finished");
}

fn execute<F>(handle: &Result<SessionHandle>, task: ProbeTask, probe: &F) -> ProbeOutcome
where
    F: Fn(&SessionHandle, &ProbeTask) -> Result<Rows>,
{
    let started = Instant::now();

    let result: std::result::Result<Rows, String> = match (&task.rejection, handle) {
        (Some(reason), _) => Err(reason.clone()),
        (None, Err(e)) => Err(e.to_string()),
        (None, Ok(handle)) => match catch_unwind(AssertUnwindSafe(|| probe(handle, &task))) {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(Error::Engine(format!(
                "Probe panicked: {}",
                panic_message(panic.as_ref())
            ))
            .to_string()),
        },
    };

    let (rows, error) = match result {
        Ok(rows) => (rows, None),
        Err(e) => (Vec::new(), Some(e)),
    };

    ProbeOutcome {
        template_id: task.template_id,
        action_id: task.action_id,
        actor_id: task.actor_id,
        database_id: task.database_id,
        object_id: task.object_id,
        query: task.query,
        rows,
        error,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
