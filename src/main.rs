#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use herd::config::PoolConfig;
use herd::logging::{self, LogConfig, LogFormat};
use herd::pool::{ClusterManager, CommandSpawner, PoolStats};
use herd::signal::SignalHandler;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

/// Run a supervised pool of JSONL worker processes
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter or level (e.g. `debug`, `herd=trace`)
    #[arg(long, global = true)]
    log: Option<String>,

    /// Log output format: pretty, compact, json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a pool, run init/bootstrap, optionally call a method on every
    /// worker, then shut the pool down
    Run {
        #[command(flatten)]
        pool: PoolArgs,

        /// Method to call on every worker after bootstrap
        #[arg(long)]
        call: Option<String>,

        /// JSON array of positional arguments for `--call`
        #[arg(long, default_value = "[]")]
        args: String,
    },

    /// Keep a pool running until SIGINT/SIGTERM, reporting stats periodically
    Serve {
        #[command(flatten)]
        pool: PoolArgs,

        /// Seconds between stats reports
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
}

#[derive(Args)]
struct PoolArgs {
    /// Worker executable
    #[arg(long)]
    worker: PathBuf,

    /// Argument passed to every worker (repeatable)
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,

    /// Number of workers (defaults to config, then CPU count)
    #[arg(long)]
    size: Option<usize>,

    /// Config file (defaults to <config dir>/herd/herd.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON parameters broadcast with `init`
    #[arg(long)]
    init: Option<String>,

    /// JSON parameters broadcast with `bootstrap`
    #[arg(long)]
    bootstrap: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new();
    if let Some(filter) = &cli.log {
        log_config = log_config.with_filter(filter.clone());
    }
    let mut log_config = log_config.with_env_overrides();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config);

    let result = match cli.command {
        Commands::Run { pool, call, args } => run(pool, call, &args),
        Commands::Serve {
            pool,
            stats_interval,
        } => serve(pool, Duration::from_secs(stats_interval.max(1))),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("herd: {:#}", e);
            process::exit(1);
        }
    }
}

fn parse_json(label: &str, raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|raw| {
        serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", label))
    })
    .transpose()
}

/// Start the pool and run the lifecycle broadcasts
fn start_pool(args: &PoolArgs, extra_methods: &[String]) -> Result<ClusterManager> {
    let config = PoolConfig::load(args.config.as_deref())?;
    let mut options = config.to_options().methods(extra_methods.iter().cloned());
    if args.size.is_some() {
        options.size = args.size;
    }

    let init = parse_json("init", args.init.as_deref())?;
    let bootstrap = parse_json("bootstrap", args.bootstrap.as_deref())?;

    let spawner = CommandSpawner::new(&args.worker).args(args.worker_args.iter().cloned());
    let pool = ClusterManager::with_spawner(spawner, options)
        .with_context(|| format!("Failed to start pool of {}", args.worker.display()))?;

    pool.init(init)?;
    pool.bootstrap(bootstrap)?;
    Ok(pool)
}

fn run(args: PoolArgs, call: Option<String>, call_args: &str) -> Result<i32> {
    let call_args: Vec<Value> =
        serde_json::from_str(call_args).context("--args must be a JSON array")?;

    let extra: Vec<String> = call.iter().cloned().collect();
    let pool = start_pool(&args, &extra)?;

    let Some(method) = call else {
        print_stats(&pool.stats());
        pool.destroy();
        return Ok(0);
    };

    let proxies = pool.proxies();
    let results: Vec<(usize, Result<Value, String>)> = thread::scope(|scope| {
        let handles: Vec<_> = proxies
            .iter()
            .enumerate()
            .map(|(index, proxy)| {
                let method = method.as_str();
                let call_args = call_args.clone();
                scope.spawn(move || {
                    let result = match proxy {
                        Some(proxy) => proxy.invoke(method, call_args).map_err(|e| e.to_string()),
                        None => Err("slot is empty".to_string()),
                    };
                    (index, result)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| (index, Err("call thread panicked".to_string())))
            })
            .collect()
    });

    let mut failed = 0;
    for (index, result) in results {
        let line = match result {
            Ok(value) => json!({ "worker": index, "result": value }),
            Err(error) => {
                failed += 1;
                json!({ "worker": index, "error": error })
            }
        };
        println!("{}", line);
    }

    pool.destroy();
    Ok(if failed == 0 { 0 } else { 2 })
}

fn serve(args: PoolArgs, stats_interval: Duration) -> Result<i32> {
    let signals = SignalHandler::new();
    signals
        .setup()
        .map_err(|e| anyhow!("Failed to install signal handlers: {}", e))?;

    let pool = start_pool(&args, &[])?;
    tracing::info!(size = pool.size(), worker = %args.worker.display(), "Serving");

    while signals.sleep(stats_interval) {
        print_stats(&pool.stats());
    }

    tracing::info!(signal = signals.signal_number(), "Shutting down");
    pool.destroy();
    print_stats(&pool.stats());
    Ok(signals.exit_code())
}

fn print_stats(stats: &PoolStats) {
    println!(
        "{}",
        json!({
            "total_slots": stats.total_slots,
            "live_workers": stats.live_workers,
            "reviving": stats.reviving,
            "crashes_observed": stats.crashes_observed,
            "revivals_succeeded": stats.revivals_succeeded,
            "revivals_abandoned": stats.revivals_abandoned,
            "destroyed": stats.destroyed,
        })
    );
}
