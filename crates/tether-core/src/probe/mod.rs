//! Readiness probing.
//!
//! A [`Probe`] answers one question: can the subordinate serve traffic
//! right now? [`ReadinessProbe`] pairs a probe with the poll interval and
//! total deadline that the harness uses to drive it.
//!
//! ```text
//! ProcessHarness::acquire
//!     |
//!     v
//! ReadinessProbe { probe: Arc<dyn Probe>, interval, deadline }
//!     |
//!     +-- HttpProbe   GET <base_url><path>, expect status
//!     +-- TcpProbe    connect(host:port)
//!     +-- FnProbe     any async closure
//! ```

pub mod http;
pub mod tcp;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::HarnessConfig;
use crate::error::HarnessError;

pub use http::HttpProbe;
pub use tcp::TcpProbe;

/// Outcome of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The subordinate is ready; the payload is probe-specific (an HTTP
    /// body, a socket address, ...).
    Ready(String),
    /// The subordinate answered but is not ready yet.
    NotReady(String),
    /// The probe itself failed, e.g. connection refused while the server
    /// is still starting. Retried exactly like `NotReady`.
    Error(String),
}

impl ProbeResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(payload) => write!(f, "ready ({payload})"),
            Self::NotReady(reason) => write!(f, "not ready: {reason}"),
            Self::Error(cause) => write!(f, "probe error: {cause}"),
        }
    }
}

/// A repeatable readiness check.
///
/// Object-safe so probes can be stored as `Arc<dyn Probe>` inside a
/// [`ReadinessProbe`].
#[async_trait]
pub trait Probe: Send + Sync {
    /// Short description for logs and error messages, e.g.
    /// `"GET http://127.0.0.1:2222/health"`.
    fn describe(&self) -> String;

    /// The connection string the caller should use once the subordinate is
    /// ready, when it is known up front. `None` means the `Ready` payload is
    /// the connection string.
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Run the check once.
    async fn check(&self) -> ProbeResult;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Probe) {}
};

/// A probe backed by an async closure.
pub struct FnProbe<F> {
    name: String,
    endpoint: Option<String>,
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeResult> + Send,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            check,
        }
    }

    /// Report `endpoint` as the connection string instead of the payload.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeResult> + Send,
{
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint.clone()
    }

    async fn check(&self) -> ProbeResult {
        (self.check)().await
    }
}

// ---------------------------------------------------------------------------
// ReadinessProbe
// ---------------------------------------------------------------------------

/// A probe plus the schedule the harness polls it on.
#[derive(Clone)]
pub struct ReadinessProbe {
    probe: Arc<dyn Probe>,
    interval: Duration,
    deadline: Duration,
}

impl fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessProbe")
            .field("probe", &self.probe.describe())
            .field("interval", &self.interval)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl ReadinessProbe {
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidSpec`] if `interval` or `deadline` is
    /// zero.
    pub fn new(
        probe: impl Probe + 'static,
        interval: Duration,
        deadline: Duration,
    ) -> Result<Self, HarnessError> {
        Self::from_arc(Arc::new(probe), interval, deadline)
    }

    /// Like [`ReadinessProbe::new`] for an already shared probe.
    pub fn from_arc(
        probe: Arc<dyn Probe>,
        interval: Duration,
        deadline: Duration,
    ) -> Result<Self, HarnessError> {
        if interval.is_zero() {
            return Err(HarnessError::InvalidSpec(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if deadline.is_zero() {
            return Err(HarnessError::InvalidSpec(
                "readiness deadline must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            probe,
            interval,
            deadline,
        })
    }

    /// Use the poll interval and deadline from `config`.
    pub fn from_config(
        probe: impl Probe + 'static,
        config: &HarnessConfig,
    ) -> Result<Self, HarnessError> {
        Self::new(probe, config.poll_interval, config.deadline)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn describe(&self) -> String {
        self.probe.describe()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.probe.endpoint()
    }

    pub async fn check(&self) -> ProbeResult {
        self.probe.check().await
    }
}
