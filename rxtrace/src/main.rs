use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anyhow::Context as _;
use aya::maps::{MapData, PerCpuArray, RingBuf};

use rxtrace::config::{Cli, CliArgs, Command, Config, ReplayArgs};
use rxtrace::decode::OutputFormat;
use rxtrace::stats::{self, StreamStats};
use rxtrace::{drain, loader};
use rxtrace_common::{EmitStats, RECORD_VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Replay(args)) => {
            init_logging(args.quiet);
            replay(args).await
        }
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

fn init_logging(quiet: bool) {
    if quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: CliArgs) -> anyhow::Result<()> {
    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    init_logging(config.quiet);

    // ── eBPF setup ────────────────────────────────────────────────────
    let (mut bpf, attached) = loader::load_and_attach(&config)?;
    let names: Vec<&str> = attached.iter().map(|h| h.name()).collect();
    tracing::info!(
        "hooks live: {} (record format v{})",
        names.join(", "),
        RECORD_VERSION
    );

    let ring_buf = RingBuf::try_from(
        bpf.take_map("EVENTS")
            .context("EVENTS map not found in eBPF object")?,
    )?;
    let emit_stats: PerCpuArray<MapData, EmitStats> = PerCpuArray::try_from(
        bpf.take_map("STATS")
            .context("STATS map not found in eBPF object")?,
    )?;

    // ── Ring drain ────────────────────────────────────────────────────
    let stream_stats = Arc::new(StreamStats::new());
    let format = OutputFormat::from_json_flag(config.json);
    let drain = drain::drain_ring(ring_buf, stream_stats.clone(), format);
    tokio::pin!(drain);

    // ── Counter report ────────────────────────────────────────────────
    // A zero interval never ticks.
    let stats_interval = config.stats_interval_seconds;
    let mut ticker = interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick(), if stats_interval > 0 => report(&emit_stats, &stream_stats),
            result = &mut drain => return result,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Ctrl-C received, detaching");
    report(&emit_stats, &stream_stats);
    drop(bpf);
    Ok(())
}

fn report(emit_stats: &PerCpuArray<MapData, EmitStats>, stream: &StreamStats) {
    match stats::read_emit_stats(emit_stats) {
        Ok(kernel) => stats::log_report(&kernel, &stream.snapshot()),
        Err(e) => tracing::warn!("failed to read STATS: {:#}", e),
    }
}

#[cfg(feature = "replay")]
async fn replay(args: ReplayArgs) -> anyhow::Result<()> {
    let hooks = if args.hooks.is_empty() {
        rxtrace_common::HookPoint::ALL.to_vec()
    } else {
        args.hooks
    };
    let format = OutputFormat::from_json_flag(args.json);
    let snapshot =
        rxtrace::replay::replay_file(&args.pcap, hooks, args.ring_bytes, format).await?;
    for (hook, count) in snapshot.per_hook {
        tracing::info!(hook = %hook, records = count, "replayed");
    }
    Ok(())
}

#[cfg(not(feature = "replay"))]
async fn replay(_args: ReplayArgs) -> anyhow::Result<()> {
    anyhow::bail!("rxtrace was built without the `replay` feature")
}
