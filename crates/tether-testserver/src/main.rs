//! Minimal HTTP health/echo server used as the subordinate process in
//! tether's end-to-end tests.
//!
//! `GET /health` answers 200 (or 503 with `--unhealthy`), `POST /echo`
//! returns the request body. Startup can be delayed or suppressed
//! entirely, and SIGTERM can be ignored, to exercise every path of the
//! harness.

mod server;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use server::ServeOptions;

#[derive(Parser)]
#[command(name = "tether-testserver", about = "HTTP health/echo server for harness tests")]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to bind
    #[arg(long)]
    port: u16,
    /// Wait this many milliseconds before binding
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,
    /// Never bind the port (simulates a server that never becomes ready)
    #[arg(long)]
    never_bind: bool,
    /// Answer /health with 503
    #[arg(long)]
    unhealthy: bool,
    /// Keep running after SIGTERM (only SIGKILL stops the server)
    #[arg(long)]
    ignore_sigterm: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.ignore_sigterm {
        ignore_sigterm()?;
    }

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cli.host, cli.port))?;

    let options = ServeOptions {
        startup_delay: Duration::from_millis(cli.startup_delay_ms),
        never_bind: cli.never_bind,
        unhealthy: cli.unhealthy,
    };

    server::run(addr, &options).await
}

/// Replace the default SIGTERM disposition with a handler that only logs.
#[cfg(unix)]
fn ignore_sigterm() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            tracing::warn!("ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> anyhow::Result<()> {
    Ok(())
}
