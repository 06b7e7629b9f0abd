//! Session-scoped subordinates.
//!
//! A [`HarnessSession`] is the explicit, lifetime-scoped replacement for a
//! "one server for the whole test run" global: the test driver creates one,
//! passes it to whoever needs an endpoint, and closes it at the end. Two
//! sessions never share processes or state.

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::handle::ProcessHandle;
use crate::harness::ProcessHarness;
use crate::launch::LaunchSpec;
use crate::probe::ReadinessProbe;

/// Named subordinates kept running for the lifetime of a session.
#[derive(Debug, Default)]
pub struct HarnessSession {
    harness: ProcessHarness,
    /// In start order, so [`HarnessSession::close`] can stop in reverse.
    running: Vec<(String, ProcessHandle)>,
}

impl HarnessSession {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            harness: ProcessHarness::new(config),
            running: Vec::new(),
        }
    }

    /// Start a subordinate under `name` and return its connection string.
    ///
    /// Fails if `name` is already running in this session, or if the
    /// acquisition fails.
    pub async fn start(
        &mut self,
        name: &str,
        spec: &LaunchSpec,
        probe: &ReadinessProbe,
    ) -> Result<String> {
        if self.position(name).is_some() {
            bail!("subordinate {name:?} is already running in this session");
        }
        let handle = self.harness.acquire(spec, probe).await?;
        let endpoint = handle.endpoint().to_string();
        info!(name, pid = handle.pid(), endpoint = %endpoint, "session subordinate started");
        self.running.push((name.to_string(), handle));
        Ok(endpoint)
    }

    /// Connection string of a running subordinate.
    pub fn endpoint(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.running[i].1.endpoint())
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.position(name).map(|i| self.running[i].1.pid())
    }

    /// Names of running subordinates, in start order.
    pub fn names(&self) -> Vec<&str> {
        self.running.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Release one subordinate. Returns `false` if `name` was not running.
    pub async fn stop(&mut self, name: &str) -> bool {
        let Some(i) = self.position(name) else {
            warn!(name, "stop requested for unknown session subordinate");
            return false;
        };
        let (_, handle) = self.running.remove(i);
        handle.release().await;
        true
    }

    /// Release every subordinate, most recently started first.
    pub async fn close(mut self) {
        while let Some((name, handle)) = self.running.pop() {
            info!(name = %name, pid = handle.pid(), "closing session subordinate");
            handle.release().await;
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.running.iter().position(|(n, _)| n == name)
    }
}
