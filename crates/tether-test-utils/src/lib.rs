//! Shared test utilities for tether integration tests.
//!
//! Provides ephemeral port allocation, process-table and port liveness
//! checks used to prove that no subordinate outlives its handle, and a
//! once-per-binary tracing subscriber.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Once;
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`),
/// writing through the test harness's captured output. Safe to call from
/// every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A loopback port that was free at the time of the call.
///
/// The port is released before returning, so another process could grab
/// it in between; good enough for tests that bind it right away.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub fn port_is_open(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

/// Whether `pid` names a live (non-zombie) process.
#[cfg(unix)]
pub fn process_is_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence checks only.
    let ret = unsafe { libc::kill(pid, 0) };
    if ret != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn process_is_running(_pid: u32) -> bool {
    false
}

/// A killed but not yet reaped child still answers `kill(pid, 0)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: libc::pid_t) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return true;
    };
    // Format: "<pid> (<comm>) <state> ..."; comm may contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: libc::pid_t) -> bool {
    false
}

/// Pids of live processes whose command line contains every one of
/// `needles` as a separate argument. Linux only; empty elsewhere.
pub fn find_processes(needles: &[&str]) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| {
            let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
                return false;
            };
            let args: Vec<&[u8]> = raw.split(|b| *b == 0).collect();
            needles
                .iter()
                .all(|needle| args.iter().any(|arg| *arg == needle.as_bytes()))
        })
        .filter(|&pid| process_is_running(pid))
        .collect()
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses.
/// Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
