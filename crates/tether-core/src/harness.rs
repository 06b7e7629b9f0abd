//! The process harness: launch, readiness gate, hand over, tear down.
//!
//! ```text
//! NOT_STARTED --launch--> STARTING --not ready / error--> STARTING
//! STARTING --ready--> READY --release--> TERMINATED
//! STARTING --deadline / cancel--> FAILED (process killed)
//! NOT_STARTED --launch fails--> FAILED
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::handle::{HandleInfo, ProcessHandle, ReadyReport};
use crate::launch::{LaunchSpec, Subordinate};
use crate::probe::{ProbeResult, ReadinessProbe};

/// Starts subordinate processes and gates them on readiness.
///
/// A harness runs one acquisition at a time; concurrent `acquire` calls on
/// the same instance queue behind each other. Separate instances share
/// nothing and acquire fully in parallel.
#[derive(Debug, Default)]
pub struct ProcessHarness {
    config: HarnessConfig,
    /// Held for the duration of one launch + readiness loop.
    acquiring: Mutex<()>,
}

/// Bookkeeping that outlives the (cancellable) polling future.
#[derive(Debug, Default)]
struct PollState {
    attempts: u32,
    last_outcome: Option<ProbeResult>,
    exit_reported: bool,
}

enum Outcome {
    Ready(String),
    TimedOut,
    Cancelled,
}

impl ProcessHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            acquiring: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Launch `spec` and wait until `probe` reports ready.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::Launch`] if the process cannot be started; returned
    ///   immediately.
    /// - [`HarnessError::ReadinessTimeout`] if the probe's deadline passes
    ///   without a `Ready` result; the process is killed first, with no
    ///   grace period.
    ///
    /// Dropping the returned future mid-acquisition kills the process.
    pub async fn acquire(
        &self,
        spec: &LaunchSpec,
        probe: &ReadinessProbe,
    ) -> Result<ProcessHandle, HarnessError> {
        self.acquire_with_cancel(spec, probe, &CancellationToken::new())
            .await
    }

    /// Like [`ProcessHarness::acquire`], but `cancel` aborts the wait: the
    /// process is killed and [`HarnessError::Cancelled`] returned.
    pub async fn acquire_with_cancel(
        &self,
        spec: &LaunchSpec,
        probe: &ReadinessProbe,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle, HarnessError> {
        let _acquiring = self.acquiring.lock().await;

        let started = Instant::now();
        let mut subordinate = spec.spawn()?;
        let pid = subordinate.pid();

        info!(
            pid,
            command = %spec.command_line(),
            probe = %probe.describe(),
            "launched subordinate, waiting for readiness"
        );

        let mut state = PollState::default();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Outcome::Cancelled,
            polled = tokio::time::timeout(
                probe.deadline(),
                poll_until_ready(&mut subordinate, probe, &mut state),
            ) => match polled {
                Ok(payload) => Outcome::Ready(payload),
                Err(_) => Outcome::TimedOut,
            },
        };

        match outcome {
            Outcome::Ready(payload) => {
                let endpoint = probe.endpoint().unwrap_or(payload);
                let ready = ReadyReport {
                    attempts: state.attempts,
                    elapsed: started.elapsed(),
                };
                info!(
                    pid,
                    endpoint = %endpoint,
                    attempts = ready.attempts,
                    elapsed_ms = u64::try_from(ready.elapsed.as_millis()).unwrap_or(u64::MAX),
                    "subordinate ready"
                );
                Ok(ProcessHandle::new(
                    subordinate,
                    endpoint,
                    ready,
                    self.config.grace_period,
                ))
            }
            Outcome::TimedOut => {
                let last_outcome = state
                    .last_outcome
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "no probe completed".to_string());
                warn!(
                    pid,
                    attempts = state.attempts,
                    last_outcome = %last_outcome,
                    "subordinate not ready before deadline, killing"
                );
                subordinate.kill_now().await;
                Err(HarnessError::ReadinessTimeout {
                    probe: probe.describe(),
                    deadline: probe.deadline(),
                    attempts: state.attempts,
                    last_outcome,
                })
            }
            Outcome::Cancelled => {
                info!(pid, attempts = state.attempts, "acquisition cancelled, killing");
                subordinate.kill_now().await;
                Err(HarnessError::Cancelled {
                    program: spec.program().to_string(),
                })
            }
        }
    }

    /// Terminate and reap a handle's process. Equivalent to
    /// [`ProcessHandle::release`].
    pub async fn release(&self, handle: ProcessHandle) {
        handle.release().await;
    }

    /// Scoped acquisition: acquire, run `body`, release.
    ///
    /// The process is released however `body` ends: normally, with an error
    /// value, or by panicking (the panic is resumed after release). If the
    /// whole future is dropped, the handle's `Drop` kills the process.
    pub async fn with_process<F, Fut, T>(
        &self,
        spec: &LaunchSpec,
        probe: &ReadinessProbe,
        body: F,
    ) -> Result<T, HarnessError>
    where
        F: FnOnce(HandleInfo) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(spec, probe).await?;
        let result = AssertUnwindSafe(body(handle.info())).catch_unwind().await;
        handle.release().await;
        match result {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Probe until `Ready`, sleeping `probe.interval()` between attempts.
///
/// Not-ready and error outcomes are retried indefinitely; the caller bounds
/// the loop with the deadline. A subordinate that exits early is reported
/// once but does not stop the loop.
async fn poll_until_ready(
    subordinate: &mut Subordinate,
    probe: &ReadinessProbe,
    state: &mut PollState,
) -> String {
    loop {
        state.attempts += 1;
        match probe.check().await {
            ProbeResult::Ready(payload) => return payload,
            other => {
                debug!(
                    pid = subordinate.pid(),
                    attempt = state.attempts,
                    outcome = %other,
                    "subordinate not ready yet"
                );
                state.last_outcome = Some(other);
            }
        }

        if !state.exit_reported {
            if let Some(status) = subordinate.try_exit_status() {
                warn!(
                    pid = subordinate.pid(),
                    %status,
                    "subordinate exited before becoming ready"
                );
                state.exit_reported = true;
            }
        }

        tokio::time::sleep(probe.interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::probe::FnProbe;

    fn sleeper() -> LaunchSpec {
        LaunchSpec::new("sleep").unwrap().arg("30")
    }

    /// Ready on the `ready_on`-th call, not ready before.
    fn ready_after(ready_on: u32, interval: Duration, deadline: Duration) -> ReadinessProbe {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = FnProbe::new("scripted", move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= ready_on {
                    ProbeResult::Ready("http://127.0.0.1:9".to_string())
                } else {
                    ProbeResult::Error("connection refused".to_string())
                }
            }
        });
        ReadinessProbe::new(probe, interval, deadline).unwrap()
    }

    fn never_ready(interval: Duration, deadline: Duration) -> ReadinessProbe {
        let probe = FnProbe::new("never", || async {
            ProbeResult::NotReady("unexpected status 503".to_string())
        });
        ReadinessProbe::new(probe, interval, deadline).unwrap()
    }

    fn fast_harness() -> ProcessHarness {
        ProcessHarness::new(HarnessConfig::default().with_grace_period(Duration::from_secs(2)))
    }

    #[tokio::test]
    async fn acquire_returns_handle_after_ready() {
        tether_test_utils::init_tracing();
        let harness = fast_harness();
        let probe = ready_after(3, Duration::from_millis(20), Duration::from_secs(5));

        let mut handle = harness.acquire(&sleeper(), &probe).await.unwrap();
        assert_eq!(handle.endpoint(), "http://127.0.0.1:9");
        assert_eq!(handle.ready_report().attempts, 3);
        assert!(handle.is_alive());

        let pid = handle.pid();
        harness.release(handle).await;
        assert!(!tether_test_utils::process_is_running(pid));
    }

    #[tokio::test]
    async fn probe_endpoint_wins_over_payload() {
        let harness = fast_harness();
        let probe = FnProbe::new("known", || async { ProbeResult::Ready("body".to_string()) })
            .with_endpoint("http://127.0.0.1:2222/api");
        let probe =
            ReadinessProbe::new(probe, Duration::from_millis(10), Duration::from_secs(1)).unwrap();

        let handle = harness.acquire(&sleeper(), &probe).await.unwrap();
        assert_eq!(handle.endpoint(), "http://127.0.0.1:2222/api");
        handle.release().await;
    }

    #[tokio::test]
    async fn missing_binary_fails_fast_with_launch_error() {
        let harness = fast_harness();
        let spec = LaunchSpec::new("/nonexistent/binary").unwrap();
        let probe = never_ready(Duration::from_millis(100), Duration::from_secs(5));

        let start = Instant::now();
        let err = harness.acquire(&spec, &probe).await.unwrap_err();
        assert!(err.is_launch(), "got: {err}");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn never_ready_times_out_and_kills_process() {
        // Default grace period; a process that ignores SIGTERM must not
        // stretch the timeout by it.
        let harness = ProcessHarness::default();
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let spec = LaunchSpec::new("sh")
            .unwrap()
            .args(["-c", "trap '' TERM; echo $$ > \"$0\"; exec sleep 30"])
            .arg(pid_file.to_string_lossy().into_owned());
        let interval = Duration::from_millis(50);
        let deadline = Duration::from_millis(500);

        let start = Instant::now();
        let err = harness
            .acquire(&spec, &never_ready(interval, deadline))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        match err {
            HarnessError::ReadinessTimeout {
                attempts,
                ref last_outcome,
                ..
            } => {
                assert!(attempts >= 2, "expected several attempts, got {attempts}");
                assert!(last_outcome.contains("503"), "got: {last_outcome}");
            }
            other => panic!("expected ReadinessTimeout, got {other}"),
        }
        assert!(elapsed >= deadline);
        // deadline + one interval, plus scheduling slack.
        assert!(elapsed < deadline + interval + Duration::from_secs(1), "took {elapsed:?}");
        assert!(elapsed < harness.config().grace_period);

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!tether_test_utils::process_is_running(pid));
    }

    #[tokio::test]
    async fn hanging_probe_is_bounded_by_deadline() {
        let harness = fast_harness();
        let probe = FnProbe::new("hangs", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ProbeResult::Ready(String::new())
        });
        let probe =
            ReadinessProbe::new(probe, Duration::from_millis(50), Duration::from_millis(300))
                .unwrap();

        let start = Instant::now();
        let err = harness.acquire(&sleeper(), &probe).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("no probe completed"), "got: {err}");
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn early_exit_still_waits_for_deadline() {
        let harness = fast_harness();
        let spec = LaunchSpec::new("sh").unwrap().args(["-c", "exit 1"]);
        let deadline = Duration::from_millis(400);

        let start = Instant::now();
        let err = harness
            .acquire(&spec, &never_ready(Duration::from_millis(50), deadline))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= deadline);
    }

    #[tokio::test]
    async fn cancellation_kills_and_reports_cancelled() {
        let harness = ProcessHarness::default();
        let stubborn = LaunchSpec::new("sh")
            .unwrap()
            .args(["-c", "trap '' TERM; exec sleep 30"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = harness
            .acquire_with_cancel(
                &stubborn,
                &never_ready(Duration::from_millis(20), Duration::from_secs(30)),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled { .. }), "got: {err}");
        // No grace period is spent on a process that never became ready.
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn dropped_acquire_future_kills_process() {
        let harness = fast_harness();
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let spec = LaunchSpec::new("sh")
            .unwrap()
            .args(["-c", "echo $$ > \"$0\"; exec sleep 30"])
            .arg(pid_file.to_string_lossy().into_owned());
        let probe = never_ready(Duration::from_millis(20), Duration::from_secs(30));

        let outer = tokio::time::timeout(Duration::from_millis(300), harness.acquire(&spec, &probe))
            .await;
        assert!(outer.is_err(), "outer timeout should have fired");

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let gone = tether_test_utils::wait_until(Duration::from_secs(5), || {
            !tether_test_utils::process_is_running(pid)
        })
        .await;
        assert!(gone, "pid {pid} survived a dropped acquisition");
    }

    #[tokio::test]
    async fn with_process_releases_after_body_error() {
        let harness = fast_harness();
        let probe = ready_after(1, Duration::from_millis(10), Duration::from_secs(1));

        let result: Result<Result<(), String>, HarnessError> = harness
            .with_process(&sleeper(), &probe, |info| async move {
                Err(format!("body failed while talking to pid {}", info.pid))
            })
            .await;

        let body_err = result.unwrap().unwrap_err();
        let pid: u32 = body_err
            .rsplit(' ')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert!(!tether_test_utils::process_is_running(pid));
    }

    #[tokio::test]
    async fn with_process_releases_after_panic() {
        let harness = fast_harness();
        let probe = ready_after(1, Duration::from_millis(10), Duration::from_secs(1));
        let seen_pid = Arc::new(AtomicU32::new(0));
        let recorder = Arc::clone(&seen_pid);

        let outcome = AssertUnwindSafe(harness.with_process(&sleeper(), &probe, |info| async move {
            recorder.store(info.pid, Ordering::SeqCst);
            if info.pid != 0 {
                panic!("test body panicked");
            }
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err(), "panic should propagate");
        let pid = seen_pid.load(Ordering::SeqCst);
        assert_ne!(pid, 0);
        assert!(!tether_test_utils::process_is_running(pid));
    }

    #[tokio::test]
    async fn separate_harnesses_acquire_concurrently() {
        let a = fast_harness();
        let b = fast_harness();
        let probe_a = ready_after(9, Duration::from_millis(50), Duration::from_secs(5));
        let probe_b = ready_after(9, Duration::from_millis(50), Duration::from_secs(5));
        let spec = sleeper();

        let start = Instant::now();
        let (ha, hb) = tokio::join!(a.acquire(&spec, &probe_a), b.acquire(&spec, &probe_b));
        let (ha, mut hb) = (ha.unwrap(), hb.unwrap());
        // Each takes ~400ms; run serially they would need ~800ms.
        assert!(start.elapsed() < Duration::from_millis(750), "took {:?}", start.elapsed());
        assert_ne!(ha.pid(), hb.pid());

        ha.release().await;
        assert!(hb.is_alive(), "releasing one handle must not touch the other");
        hb.release().await;
    }

    #[tokio::test]
    async fn one_harness_serializes_acquisitions() {
        let harness = fast_harness();
        let probe_a = ready_after(4, Duration::from_millis(50), Duration::from_secs(5));
        let probe_b = ready_after(4, Duration::from_millis(50), Duration::from_secs(5));
        let spec = sleeper();

        let start = Instant::now();
        let (ha, hb) = tokio::join!(
            harness.acquire(&spec, &probe_a),
            harness.acquire(&spec, &probe_b)
        );
        // Two ~150ms acquisitions back to back.
        assert!(start.elapsed() >= Duration::from_millis(300), "took {:?}", start.elapsed());
        ha.unwrap().release().await;
        hb.unwrap().release().await;
    }
}
