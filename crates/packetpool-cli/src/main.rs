//! Replays an offline packet capture through the worker-pool runtime and
//! reports the verdict for every packet as JSON.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use packetpool::{OfflineCapture, PassThroughEngine, PoolConfig, RuntimeError, WorkerPool};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Replay a packet capture through the worker-pool runtime.
#[derive(Parser, Debug)]
#[command(name = "packetpool-cli", about = "Replay a packet capture through the worker-pool runtime")]
struct Args {
    /// TOML pool configuration file. CLI flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON packet list: `[{"id": 1, "data": "deadbeef"}, ...]`.
    #[arg(long)]
    packets: PathBuf,

    /// Overrides `workers` from the config file.
    #[arg(long)]
    workers: Option<usize>,

    /// Overrides `script` from the config file.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Overrides `grammar_debug` from the config file.
    #[arg(long)]
    grammar_debug: bool,

    /// Overrides `attach_debugger` from the config file.
    #[arg(long)]
    attach_debugger: bool,

    /// Overrides `log_filter` from the config file.
    #[arg(long)]
    log_filter: Option<String>,
}

#[derive(Deserialize)]
struct PacketEntry {
    id: u64,
    data: String,
}

#[derive(Serialize)]
struct Report {
    accepted: Vec<u64>,
    dropped: Vec<u64>,
}

fn load_config(args: &Args) -> Result<PoolConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|err| format!("read config {}: {err}", path.display()))?;
            toml::from_str(&raw).map_err(|err| format!("parse config {}: {err}", path.display()))?
        }
        None => PoolConfig::default(),
    };

    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(script) = &args.script {
        config.script = script.clone();
    }
    if args.grammar_debug {
        config.grammar_debug = true;
    }
    if args.attach_debugger {
        config.attach_debugger = true;
    }
    if let Some(filter) = &args.log_filter {
        config.log_filter = filter.clone();
    }
    Ok(config)
}

fn load_packets(path: &PathBuf) -> Result<Vec<(u64, Vec<u8>)>, String> {
    let raw = fs::read_to_string(path).map_err(|err| format!("read packets {}: {err}", path.display()))?;
    let entries: Vec<PacketEntry> =
        serde_json::from_str(&raw).map_err(|err| format!("parse packets {}: {err}", path.display()))?;
    entries
        .into_iter()
        .map(|entry| {
            hex::decode(&entry.data)
                .map(|data| (entry.id, data))
                .map_err(|err| format!("packet {}: invalid hex: {err}", entry.id))
        })
        .collect()
}

fn exit_code_for(err: &RuntimeError) -> i32 {
    match err {
        RuntimeError::Refused => 2,
        RuntimeError::CaptureInit(_) | RuntimeError::ScriptInit(_) => 3,
        RuntimeError::Memory | RuntimeError::Os(_) | RuntimeError::ResourceExhausted(_) => 4,
        RuntimeError::ScriptRuntime(_) | RuntimeError::BackendEof => 5,
    }
}

fn main() {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|err| {
        eprintln!("packetpool-cli: {err}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .with_writer(std::io::stderr)
        .init();

    let packets = load_packets(&args.packets).unwrap_or_else(|err| {
        tracing::error!(%err, "failed to load packet list");
        std::process::exit(1);
    });

    let worker_count = config.workers.max(1);
    let backend = Arc::new(OfflineCapture::new(packets, worker_count, "raw"));

    let result = (|| -> Result<(), RuntimeError> {
        let mut pool = WorkerPool::create(
            Arc::clone(&backend),
            &config,
            Box::new(|| Box::new(PassThroughEngine::default())),
        )?;
        pool.start()?;
        pool.wait()?;
        Ok(())
    })();

    if let Err(err) = result {
        tracing::error!(error = %err, "worker pool run failed");
        std::process::exit(exit_code_for(&err));
    }

    let report = Report {
        accepted: backend.accepts(),
        dropped: backend.drops(),
    };
    let json = serde_json::to_string(&report).expect("Report is always serializable");
    println!("{json}");
}
