//! Launching and terminating the subordinate process.
//!
//! [`LaunchSpec`] is the immutable description of what to run. Spawning it
//! yields a [`Subordinate`], the crate-internal owner of the OS process.
//! A `Subordinate` exists from the instant the process is started, so any
//! exit path out of an acquisition (timeout, cancellation, a dropped
//! future) tears the process down through its `Drop` impl.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::HarnessError;

/// Where a subordinate's stdout or stderr goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdioTarget {
    /// Share the parent's stream, so server logs interleave with test output.
    #[default]
    Inherit,
    /// Discard the stream.
    Null,
    /// Append to a file, creating it if missing.
    File(PathBuf),
}

impl StdioTarget {
    fn open(&self) -> std::io::Result<Stdio> {
        match self {
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Null => Ok(Stdio::null()),
            Self::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            }
        }
    }
}

/// Immutable description of the subordinate process to start.
///
/// Built with [`LaunchSpec::new`] plus chained setters:
///
/// ```ignore
/// let spec = LaunchSpec::new("uvicorn")?
///     .args(["--host", "127.0.0.1", "--port", "2222"])
///     .stdout(StdioTarget::Null);
/// ```
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdout: StdioTarget,
    stderr: StdioTarget,
    process_group: bool,
}

impl LaunchSpec {
    /// Create a spec for `program`, which is resolved against `$PATH` when
    /// it is not a path.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidSpec`] if `program` is empty.
    pub fn new(program: impl Into<String>) -> Result<Self, HarnessError> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(HarnessError::InvalidSpec(
                "executable must not be empty".to_string(),
            ));
        }
        Ok(Self {
            program,
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            stdout: StdioTarget::Inherit,
            stderr: StdioTarget::Inherit,
            process_group: true,
        })
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments, in order.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the process from `dir` instead of the caller's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdout(mut self, target: StdioTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn stderr(mut self, target: StdioTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Whether to start the process in its own process group (Unix only,
    /// on by default). Termination signals then reach every process the
    /// subordinate forks, not just the leader.
    pub fn process_group(mut self, enabled: bool) -> Self {
        self.process_group = enabled;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// The command line as a single display string.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Start the process.
    ///
    /// Fails with [`HarnessError::Launch`] if the executable is missing,
    /// not executable, or a redirection target cannot be opened. Nothing is
    /// left running on failure.
    pub(crate) fn spawn(&self) -> Result<Subordinate, HarnessError> {
        let launch_err = |source: std::io::Error| HarnessError::Launch {
            program: self.program.clone(),
            source,
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(self.stdout.open().map_err(launch_err)?);
        cmd.stderr(self.stderr.open().map_err(launch_err)?);
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        {
            if self.process_group {
                cmd.process_group(0);
            }
        }

        let child = cmd.spawn().map_err(launch_err)?;
        let Some(pid) = child.id() else {
            return Err(launch_err(std::io::Error::other(
                "child process has no pid",
            )));
        };

        debug!(pid, command = %self.command_line(), "spawned subordinate process");

        Ok(Subordinate {
            child,
            pid,
            program: self.program.clone(),
            group: cfg!(unix) && self.process_group,
            reaped: false,
            group_swept: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Running process
// ---------------------------------------------------------------------------

/// Exclusive owner of a started subordinate process.
///
/// Once the leader has been reaped only one more signal is sent: a final
/// SIGKILL to its process group, so members it forked do not outlive it.
#[derive(Debug)]
pub(crate) struct Subordinate {
    child: Child,
    pid: u32,
    program: String,
    /// The process leads its own process group (pgid == pid).
    group: bool,
    reaped: bool,
    /// The final group SIGKILL has been sent; no more signals after this.
    group_swept: bool,
}

impl Subordinate {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    /// Non-blocking exit check. Reaps the process if it has exited.
    pub(crate) fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.reaped {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "error checking subordinate status");
                None
            }
        }
    }

    /// `true` while the process has not exited.
    pub(crate) fn is_running(&mut self) -> bool {
        !self.reaped && self.try_exit_status().is_none()
    }

    pub(crate) fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Terminate and reap the process: SIGTERM, wait up to `grace`, then
    /// SIGKILL. Whatever is left of the process group is killed afterwards.
    /// Never fails; problems are logged. Calling it again is a no-op.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        if !self.reaped {
            if let Some(status) = self.try_exit_status() {
                debug!(pid = self.pid, %status, "subordinate had already exited");
            } else {
                self.term_then_kill(grace).await;
            }
        }
        self.sweep_group();
    }

    /// SIGKILL and reap without a grace period. Used for processes that
    /// never became ready.
    pub(crate) async fn kill_now(&mut self) {
        if !self.reaped && self.try_exit_status().is_none() {
            self.force_kill();
            if let Err(e) = self.child.wait().await {
                warn!(pid = self.pid, error = %e, "failed to reap subordinate");
            }
            self.reaped = true;
        }
        self.sweep_group();
    }

    async fn term_then_kill(&mut self, grace: Duration) {
        #[cfg(unix)]
        {
            self.signal(libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, %status, "subordinate exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "error waiting for subordinate, sending SIGKILL");
                self.force_kill();
                if let Err(e) = self.child.wait().await {
                    warn!(pid = self.pid, error = %e, "failed to reap subordinate");
                }
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "subordinate ignored SIGTERM, sending SIGKILL"
                );
                self.force_kill();
                if let Err(e) = self.child.wait().await {
                    warn!(pid = self.pid, error = %e, "failed to reap subordinate");
                }
            }
        }

        self.reaped = true;
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        {
            if self.group {
                self.signal(libc::SIGKILL);
            }
        }
        // Already-exited children report an error here; nothing to do.
        let _ = self.child.start_kill();
    }

    /// SIGKILL whatever remains of the process group once the leader is
    /// reaped. At most once per subordinate.
    fn sweep_group(&mut self) {
        if !self.group || self.group_swept {
            return;
        }
        self.group_swept = true;
        #[cfg(unix)]
        {
            self.signal(libc::SIGKILL);
        }
    }

    /// Deliver `signal` to the process, or to its whole group. ESRCH means
    /// the target is already gone and is not worth a warning.
    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            warn!(pid = self.pid, "pid out of range, cannot signal");
            return;
        };
        let target = if self.group { -pid } else { pid };
        // SAFETY: `pid` belongs to a child we spawned. Before it is reaped
        // neither it nor its pgid can be recycled; after, the pgid stays ours
        // while any group member is alive, and ESRCH otherwise.
        let ret = unsafe { libc::kill(target, signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(pid = self.pid, signal, "signal target already gone");
            } else {
                warn!(pid = self.pid, signal, error = %err, "failed to deliver signal");
            }
        }
    }
}

impl Drop for Subordinate {
    fn drop(&mut self) {
        if self.reaped {
            self.sweep_group();
            return;
        }
        debug!(pid = self.pid, "subordinate dropped while running, killing");
        self.force_kill();
        self.group_swept = self.group;
        // Reap now if the kill already landed; otherwise tokio reaps the
        // orphan in the background.
        let _ = self.child.try_wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_program_is_rejected() {
        let err = LaunchSpec::new("").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidSpec(_)));

        let err = LaunchSpec::new("   ").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidSpec(_)));
    }

    #[test]
    fn builder_keeps_argument_order() {
        let spec = LaunchSpec::new("server")
            .unwrap()
            .arg("--host")
            .arg("127.0.0.1")
            .args(["--port", "2222"]);
        assert_eq!(spec.program(), "server");
        assert_eq!(spec.get_args(), ["--host", "127.0.0.1", "--port", "2222"]);
        assert_eq!(spec.command_line(), "server --host 127.0.0.1 --port 2222");
    }

    #[test]
    fn defaults_inherit_stdio_and_use_process_group() {
        let spec = LaunchSpec::new("true").unwrap();
        assert_eq!(spec.stdout, StdioTarget::Inherit);
        assert_eq!(spec.stderr, StdioTarget::Inherit);
        assert!(spec.process_group);
        assert!(spec.get_current_dir().is_none());
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_launch_error() {
        let spec = LaunchSpec::new("/nonexistent/binary").unwrap();
        let err = spec.spawn().unwrap_err();
        assert!(err.is_launch(), "expected launch error, got: {err}");
    }

    #[tokio::test]
    async fn unopenable_redirect_is_launch_error() {
        let spec = LaunchSpec::new("true")
            .unwrap()
            .stdout(StdioTarget::File(PathBuf::from("/nonexistent/dir/out.log")));
        let err = spec.spawn().unwrap_err();
        assert!(err.is_launch(), "expected launch error, got: {err}");
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let spec = LaunchSpec::new("sleep").unwrap().arg("30");
        let mut sub = spec.spawn().unwrap();
        assert!(sub.is_running());

        sub.terminate(Duration::from_secs(5)).await;
        assert!(sub.is_reaped());
        assert!(!sub.is_running());

        // Second call is a no-op.
        sub.terminate(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn terminate_after_natural_exit_is_quiet() {
        let spec = LaunchSpec::new("true").unwrap();
        let mut sub = spec.spawn().unwrap();
        let status = sub.child.wait().await.unwrap();
        assert!(status.success());
        sub.reaped = true;

        sub.terminate(Duration::from_secs(1)).await;
        assert!(sub.is_reaped());
    }

    #[tokio::test]
    async fn env_and_stdout_file_are_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out.log");
        let spec = LaunchSpec::new("sh")
            .unwrap()
            .args(["-c", "echo \"$TETHER_GREETING\""])
            .env("TETHER_GREETING", "hello from child")
            .current_dir(dir.path())
            .stdout(StdioTarget::File(out.clone()));

        let mut sub = spec.spawn().unwrap();
        sub.child.wait().await.unwrap();
        sub.reaped = true;

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "hello from child");
    }

    fn read_pid(path: &Path) -> u32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_member_that_ignores_sigterm() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("member.pid");
        // The leader exits on SIGTERM; the background member ignores it.
        let spec = LaunchSpec::new("sh")
            .unwrap()
            .args(["-c", "(trap '' TERM; sleep 30) & echo $! > \"$0\"; wait"])
            .arg(pid_file.to_string_lossy().into_owned());
        let mut sub = spec.spawn().unwrap();

        let written = tether_test_utils::wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&pid_file).is_ok_and(|raw| raw.trim().parse::<u32>().is_ok())
        })
        .await;
        assert!(written, "member pid never recorded");
        let member = read_pid(&pid_file);
        assert!(tether_test_utils::process_is_running(member));

        sub.terminate(Duration::from_secs(2)).await;
        assert!(sub.is_reaped());
        let gone = tether_test_utils::wait_until(Duration::from_secs(5), || {
            !tether_test_utils::process_is_running(member)
        })
        .await;
        assert!(gone, "group member {member} survived terminate");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_now_skips_the_grace_period() {
        let spec = LaunchSpec::new("sh")
            .unwrap()
            .args(["-c", "trap '' TERM; sleep 30"]);
        let mut sub = spec.spawn().unwrap();
        let pid = sub.pid();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        sub.kill_now().await;
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
        assert!(sub.is_reaped());
        assert!(!tether_test_utils::process_is_running(pid));
    }
}
