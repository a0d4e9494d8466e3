use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::{Config, Environment, File as ConfigFile};
use rpcflood_engine::{FloodConfig, DEFAULT_METHODS};
use serde::Deserialize;

const DEFAULT_RPC: &str = "http://127.0.0.1:8545";

#[derive(Debug, Parser, Clone)]
#[command(author, version, about = "Weighted JSON-RPC load generator", long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// JSON-RPC endpoint to flood [default: http://127.0.0.1:8545]
    #[arg(long)]
    pub rpc: Option<String>,

    /// Endpoint used to refresh chain state. Defaults to --rpc.
    #[arg(long)]
    pub state_rpc: Option<String>,

    /// Method mix entry as NAME:WEIGHT. Repeat to build the mix.
    #[arg(short = 'm', long = "method", value_name = "NAME:WEIGHT", value_parser = parse_method)]
    pub methods: Vec<(String, u64)>,

    /// Number of concurrent workers [default: 250]
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Requests per second across all workers
    #[arg(short, long)]
    pub rate_limit: Option<f64>,

    /// Stop after generating this many queries
    #[arg(long)]
    pub max_queries: Option<u64>,

    /// Seed for a reproducible query stream
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log filter used when RUST_LOG is unset [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// `json` or `pretty` [default: pretty]
    #[arg(long)]
    pub log_format: Option<String>,
}

/// Parse a `name:weight` pair.
pub fn parse_method(raw: &str) -> Result<(String, u64)> {
    let (name, weight) = raw
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected NAME:WEIGHT, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("missing method name in `{raw}`"));
    }
    let weight = weight
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid weight in `{raw}`"))?;
    Ok((name.to_string(), weight))
}

/// File and `RPCFLOOD_*` environment layer.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    rpc: Option<String>,
    state_rpc: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
    /// Entries in the same `name:weight` form as `--method`.
    methods: Option<Vec<String>>,
    flood: FloodConfig,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub rpc: String,
    pub state_rpc: String,
    pub methods: Vec<(String, u64)>,
    pub log_level: String,
    pub log_format: String,
    pub flood: FloodConfig,
}

impl Settings {
    /// Defaults, then the config file, then `RPCFLOOD_*` variables, then flags.
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = &args.config {
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(
            Environment::with_prefix("RPCFLOOD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let file: FileSettings = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        Self::merge(file, args)
    }

    fn merge(file: FileSettings, args: &Args) -> Result<Self> {
        let rpc = args
            .rpc
            .clone()
            .or(file.rpc)
            .unwrap_or_else(|| DEFAULT_RPC.to_string());
        let state_rpc = args
            .state_rpc
            .clone()
            .or(file.state_rpc)
            .unwrap_or_else(|| rpc.clone());

        let methods = if !args.methods.is_empty() {
            args.methods.clone()
        } else if let Some(methods) = file.methods {
            methods
                .iter()
                .map(|entry| parse_method(entry))
                .collect::<Result<Vec<_>>>()?
        } else {
            DEFAULT_METHODS
                .iter()
                .map(|(name, weight)| (name.to_string(), *weight))
                .collect()
        };

        let mut flood = file.flood;
        if let Some(workers) = args.workers {
            flood.workers = workers;
        }
        if args.rate_limit.is_some() {
            flood.rate_limit = args.rate_limit;
        }
        if args.max_queries.is_some() {
            flood.max_queries = args.max_queries;
        }
        if args.seed.is_some() {
            flood.seed = args.seed;
        }

        Ok(Self {
            state_rpc,
            rpc,
            methods,
            log_level: args
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            log_format: args
                .log_format
                .clone()
                .or(file.log_format)
                .unwrap_or_else(|| "pretty".to_string()),
            flood,
        })
    }
}
