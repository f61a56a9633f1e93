// Copyright (c) contributors.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

mod broker;
mod config;
mod fetcher;
mod handler;
mod http_control;
mod metrics;
mod pr_builder;
mod sleep;
mod supervisor;
mod worker;

use anyhow::{Context, Result};
use config::Config;
use hosting_client::HostingClient;
use log::Level;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::io::AsyncWriteExt;

const HOSTING_API_BASE: &str = "https://api.github.com/";

#[derive(StructOpt, Debug)]
#[structopt(name = "ci-supervisor")]
struct Opt {
    /// Port to serve the HTTP control surface on. When omitted, the
    /// supervisor runs with no network-reachable control surface at all,
    /// just the worker tree.
    #[structopt(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    if let Some(port) = opt.port {
        ensure!(
            (1024..65535).contains(&port),
            "CI server port must be in range 1024-65535, got {}",
            port
        );
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let (log_tx, log_rx) = tokio::sync::mpsc::unbounded_channel();
    ci_telemetry::install_logger(log_tx, Level::Info)
        .context("installing process-wide logger")?;
    tokio::spawn(drain_logs(log_rx));

    let config = Arc::new(Config::from_env().context("loading configuration from environment")?);

    let base_url = url::Url::parse(HOSTING_API_BASE).expect("static base URL always parses");
    let client = HostingClient::new(
        base_url,
        config.github_token.clone(),
        config.pr_repo.clone(),
        PathBuf::from(&config.github_cache_path),
    )
    .await
    .context("constructing hosting-service client")?;

    let sup = supervisor::Supervisor::new(client, config);
    let (supervisor_tx, supervisor_rx) = tokio::sync::mpsc::channel(64);
    let supervisor_join = tokio::spawn(sup.run(supervisor_rx));

    let exit = match opt.port {
        Some(port) => serve_with_http(supervisor_tx, supervisor_join, port).await,
        None => supervisor_join.await.context("supervisor task panicked"),
    };

    match exit {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("ci-supervisor exiting with error: {:?}", e);
            Err(e)
        }
    }
}

async fn serve_with_http(
    supervisor_tx: tokio::sync::mpsc::Sender<broker::ParentMessage>,
    supervisor_join: tokio::task::JoinHandle<()>,
    port: u16,
) -> Result<()> {
    let app = http_control::router(supervisor_tx);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("serving control surface on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control surface to {}", addr))?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("http control surface exited")?;
        }
        result = supervisor_join => {
            result.context("supervisor task panicked")?;
        }
    }

    Ok(())
}

/// Drains the process-wide logging sink: appends every record to a
/// per-run log file named after its start time, and mirrors it to
/// stdout (`DEBUG`/`INFO`) or stderr (`WARN`/`ERROR`) depending on level.
async fn drain_logs(mut rx: tokio::sync::mpsc::UnboundedReceiver<ci_telemetry::LogRecord>) {
    let log_path = format!("{}.ci.log", chrono::Utc::now().timestamp());
    let mut file = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("failed to open log file {}: {}", log_path, e);
            None
        }
    };

    while let Some(record) = rx.recv().await {
        let line = record.format();
        match record.level {
            log::Level::Debug | log::Level::Info => println!("{}", line),
            log::Level::Warn | log::Level::Error | log::Level::Trace => eprintln!("{}", line),
        }
        if let Some(file) = &mut file {
            let _ = file.write_all(format!("{}\n", line).as_bytes()).await;
        }
    }
}
