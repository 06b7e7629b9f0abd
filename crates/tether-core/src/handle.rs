use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::launch::Subordinate;

/// How an acquisition reached readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyReport {
    /// Probe invocations, including the successful one.
    pub attempts: u32,
    /// Time from launch to the first `Ready` result.
    pub elapsed: Duration,
}

/// Owned snapshot of a handle's identity, for code that only needs to talk
/// to the subordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub id: Uuid,
    pub pid: u32,
    pub endpoint: String,
    pub ready: ReadyReport,
}

/// A ready subordinate process.
///
/// Only [`crate::ProcessHarness`] creates handles, and only after a `Ready`
/// probe result. The handle is the sole owner of the process: it is neither
/// `Clone` nor `Copy`. Release it with [`ProcessHandle::release`]; if it is
/// dropped instead, the process is killed without a grace period.
#[derive(Debug)]
pub struct ProcessHandle {
    id: Uuid,
    subordinate: Subordinate,
    endpoint: String,
    ready: ReadyReport,
    grace_period: Duration,
    released: bool,
}

impl ProcessHandle {
    pub(crate) fn new(
        subordinate: Subordinate,
        endpoint: String,
        ready: ReadyReport,
        grace_period: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subordinate,
            endpoint,
            ready,
            grace_period,
            released: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.subordinate.pid()
    }

    /// Connection string for downstream consumers, e.g.
    /// `http://127.0.0.1:2222/api`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn program(&self) -> &str {
        self.subordinate.program()
    }

    pub fn ready_report(&self) -> ReadyReport {
        self.ready
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            pid: self.pid(),
            endpoint: self.endpoint.clone(),
            ready: self.ready,
        }
    }

    /// Whether the subordinate is still running. Reaps it if it has exited
    /// on its own.
    pub fn is_alive(&mut self) -> bool {
        self.subordinate.is_running()
    }

    /// Terminate and reap the subordinate: SIGTERM, then SIGKILL after the
    /// grace period. Processes left in its group are killed too, including
    /// when the subordinate already exited on its own. Idempotent.
    pub async fn terminate(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.subordinate.terminate(self.grace_period).await;
        info!(
            handle = %self.id,
            pid = self.subordinate.pid(),
            endpoint = %self.endpoint,
            "released subordinate"
        );
    }

    /// Terminate the subordinate and give up the handle.
    pub async fn release(mut self) {
        self.terminate().await;
    }
}
