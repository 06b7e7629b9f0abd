//! Managed subordinate processes for integration tests.
//!
//! A [`ProcessHarness`] starts a long-lived server process, blocks until a
//! [`ReadinessProbe`] reports it ready, and hands back a [`ProcessHandle`]
//! carrying the connection string. The process is terminated and reaped
//! when the handle is released, when a scoped acquisition ends, or, as a
//! last resort, when the handle is dropped.
//!
//! ```ignore
//! let harness = ProcessHarness::new(HarnessConfig::from_env()?);
//! let spec = LaunchSpec::new("uvicorn")?
//!     .args(["--factory", "app:create_app", "--port", "2222"]);
//! let probe = ReadinessProbe::new(
//!     HttpProbe::new("http://127.0.0.1:2222/api", "/admin/hello")?,
//!     Duration::from_millis(100),
//!     Duration::from_secs(10),
//! )?;
//!
//! harness
//!     .with_process(&spec, &probe, |server| async move {
//!         run_client_tests(&server.endpoint).await
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod harness;
pub mod launch;
pub mod probe;
pub mod session;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use handle::{HandleInfo, ProcessHandle, ReadyReport};
pub use harness::ProcessHarness;
pub use launch::{LaunchSpec, StdioTarget};
pub use probe::{FnProbe, HttpProbe, Probe, ProbeResult, ReadinessProbe, TcpProbe};
pub use session::HarnessSession;
