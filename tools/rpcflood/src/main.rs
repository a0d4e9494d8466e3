use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rpcflood_chain::HttpChainClient;
use rpcflood_engine::{
    install, CancellationToken, Engine, HttpTransport, QueryRegistry, RunSummary,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use crate::config::{Args, Settings};

const SETUP_FAILURE: u8 = 1;
const RUNTIME_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match Settings::load(&args) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("rpcflood: {err:#}");
            return ExitCode::from(SETUP_FAILURE);
        }
    };
    if let Err(err) = init_logging(&settings) {
        eprintln!("rpcflood: {err:#}");
        return ExitCode::from(SETUP_FAILURE);
    }

    let engine = match build_engine(&settings) {
        Ok(engine) => engine,
        Err(err) => {
            error!("setup failed: {err:#}");
            eprintln!("rpcflood: {err:#}");
            return ExitCode::from(SETUP_FAILURE);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, stopping"),
                Err(err) => warn!("failed to listen for ctrl-c: {err}"),
            }
            cancel.cancel();
        }
    });

    info!(
        rpc = %settings.rpc,
        state_rpc = %settings.state_rpc,
        methods = settings.methods.len(),
        "rpcflood starting"
    );

    match engine.run(cancel).await {
        Ok(summary) => {
            print_summary(&settings, &summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("fatal: {err}");
            eprintln!("rpcflood: {err}");
            ExitCode::from(RUNTIME_FAILURE)
        }
    }
}

fn init_logging(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .with_context(|| format!("invalid log level `{}`", settings.log_level))?;

    if settings.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

fn build_engine(settings: &Settings) -> Result<Engine<HttpChainClient>> {
    let client = HttpChainClient::new(&settings.state_rpc)
        .with_context(|| format!("invalid state endpoint `{}`", settings.state_rpc))?;
    let transport = HttpTransport::new(&settings.rpc, settings.flood.workers)
        .with_context(|| format!("invalid target endpoint `{}`", settings.rpc))?;

    let mut registry = QueryRegistry::new();
    install(
        &mut registry,
        settings
            .methods
            .iter()
            .map(|(method, weight)| (method.as_str(), *weight)),
    )
    .context("invalid method mix")?;
    if registry.is_empty() {
        anyhow::bail!("no methods with a positive weight configured");
    }

    Engine::new(
        settings.flood.clone(),
        client,
        registry,
        Arc::new(transport),
    )
    .context("invalid configuration")
}

fn print_summary(settings: &Settings, summary: &RunSummary) {
    println!("RPC endpoint: {}", settings.rpc);
    println!(
        "Requests: {} | Failed: {}",
        summary.requests, summary.failures
    );
    println!(
        "Elapsed: {:.2?} | Req/s: {:.2}",
        summary.elapsed,
        summary.requests_per_second()
    );
}
