mod cli;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use barfeat_rs::pipeline::{run_features, run_merge};
use barfeat_rs::registry::{find_indicator, indicator_names};
use clap::Parser;
use cli::{Cli, Commands, FeaturesArgs, MergeArgs};
use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Console logs go to stderr; stdout carries feature rows.
fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("failed to create log directory {parent:?}: {err}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| anyhow!("failed to open log file {path:?}: {err}"))?;
        let (non_blocking_writer, guard) = non_blocking(file);
        // The writer flushes on guard drop; keep it for the whole process.
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

fn log_invocation(log_file: Option<&PathBuf>) {
    let cwd = std::env::current_dir().ok();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cwd = ?cwd,
        log_file = ?log_file,
        argv = ?argv,
        "barfeat_cli invoked"
    );
    if argv.len() >= 2 {
        info!(
            "cargo_repro_command=cargo run --release -p barfeat_cli -- {}",
            argv[1..].join(" ")
        );
    }
}

fn run_features_command(args: FeaturesArgs) -> Result<()> {
    let config = args.into_config()?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let table = run_features(&config, &mut handle)?;
    handle.flush().context("Failed to flush stdout")?;
    info!(
        features = table.width(),
        rows = table.len(),
        "Feature run complete"
    );
    Ok(())
}

fn run_merge_command(args: MergeArgs) -> Result<()> {
    let workers = args.workers.unwrap_or(0);
    let config = args.into_config()?;

    let summary = run_merge(&config, workers)?;
    for asset in &summary.report.assets {
        info!(
            asset = %asset.asset,
            trades = asset.trades,
            matched = asset.matched,
            unmatched = asset.unmatched(),
            "Asset alignment"
        );
    }
    info!(
        written = summary.written,
        path = %config.output_csv.display(),
        "Merge complete"
    );
    Ok(())
}

fn print_indicators() -> Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    for name in indicator_names() {
        if let Some(spec) = find_indicator(name) {
            writeln!(handle, "{}({})\t{}", spec.name, spec.usage, spec.description)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_file.as_ref())?;
    log_invocation(cli.log_file.as_ref());

    match cli.command {
        Commands::Features(args) => run_features_command(args),
        Commands::MergeTrades(args) => run_merge_command(args),
        Commands::Indicators => print_indicators(),
    }
}
