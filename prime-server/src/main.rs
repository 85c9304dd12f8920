//! HTTP API and notification stream over one shared engine.
//!
//! The engine (and its blocking model client) is built before the async
//! runtime starts. A self-update flips the engine's restart signal; the server
//! then shuts down and exits with `exit_codes::RESTART` so a supervisor can
//! start the new version.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use prime::exit_codes;
use prime::io::config::{Overrides, resolve_config};
use prime::{Engine, logging};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::AppState;

/// Open SSE streams never finish on their own; they get this long after a
/// shutdown request before the server stops waiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "prime-server")]
#[command(about = "HTTP API and event stream for the prime engine")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, env = "PRIME_PORT", default_value = "5000")]
    port: u16,

    /// Directory holding config, task rows, history and step logs
    #[arg(long, env = "PRIME_DATA_DIR", default_value = ".prime")]
    data_dir: PathBuf,

    /// Base URL of the Ollama-compatible model server
    #[arg(long, env = "OLLAMA_URL")]
    model_url: Option<String>,

    /// Model name passed to the server
    #[arg(long, env = "OLLAMA_MODEL")]
    model: Option<String>,
}

fn main() {
    logging::init("warn,prime=info,prime_server=info");
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    let config = resolve_config(&Overrides {
        data_dir: args.data_dir.clone(),
        model_url: args.model_url.clone(),
        model_name: args.model.clone(),
    })?;
    info!(data_dir = %config.data_dir.display(), model = %config.model.name, "starting prime-server");
    let engine = Engine::open(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(serve(&args, engine.clone()))?;
    drop(runtime);

    if *engine.restart_signal().borrow() {
        info!("exiting for restart after self-update");
        return Ok(exit_codes::RESTART);
    }
    Ok(exit_codes::OK)
}

async fn serve(args: &Args, engine: Engine) -> Result<()> {
    let restart = engine.restart_signal();
    let app = routes::app(AppState::new(engine));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown(restart).await;
        stop_tx.send_replace(true);
    });

    let mut graceful = stop_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = graceful.wait_for(|stop| *stop).await;
    });

    let mut deadline = stop_rx;
    tokio::select! {
        result = async move { server.await } => result.context("serve http")?,
        _ = async move {
            let _ = deadline.wait_for(|stop| *stop).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => warn!("shutdown grace elapsed with connections still open"),
    }
    Ok(())
}

async fn wait_for_shutdown(mut restart: watch::Receiver<bool>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(err = %err, "ctrl-c handler failed");
            }
            info!("interrupt received, shutting down");
        }
        _ = restart.wait_for(|requested| *requested) => {
            info!("restart requested, shutting down");
        }
    }
}
