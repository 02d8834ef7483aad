use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use rxtrace_common::{HookPoint, SkbLayout, RING_BUF_BYTES};

/// How the `nic_rx` XDP program is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Let the kernel pick (native if the driver supports it).
    #[default]
    Default,
    /// Generic XDP, works on every interface.
    Skb,
    /// Native driver mode.
    Drv,
    /// Offloaded to the NIC.
    Hw,
}

/// Agent configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface the `nic_rx` XDP program is attached to.
    #[serde(default)]
    pub interface: Option<String>,

    /// Compiled eBPF object.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: PathBuf,

    #[serde(default)]
    pub xdp_mode: XdpMode,

    /// Hook points to attach, all five by default.
    #[serde(default = "default_hooks")]
    pub hooks: Vec<HookPoint>,

    /// Print records as JSON lines instead of text.
    #[serde(default)]
    pub json: bool,

    /// Period of the counter report. 0 = disabled.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// `struct sk_buff` offsets for the running kernel (see `pahole -C sk_buff vmlinux`).
    #[serde(default = "default_skb_layout")]
    pub skb_layout: SkbLayout,
}

fn default_ebpf_object() -> PathBuf {
    PathBuf::from("rxtrace-ebpf/target/bpfel-unknown-none/release/rxtrace")
}

fn default_hooks() -> Vec<HookPoint> {
    HookPoint::ALL.to_vec()
}

fn default_stats_interval() -> u64 {
    10
}

/// Linux 6.1, x86_64, default config.
pub fn default_skb_layout() -> SkbLayout {
    SkbLayout {
        len: 112,
        queue_mapping: 124,
        head: 200,
        tail: 188,
        network_header: 184,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            ebpf_object: default_ebpf_object(),
            xdp_mode: XdpMode::default(),
            hooks: default_hooks(),
            json: false,
            stats_interval_seconds: default_stats_interval(),
            quiet: false,
            skb_layout: default_skb_layout(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.interface.is_some() {
            self.interface = cli.interface.clone();
        }
        if let Some(ref path) = cli.ebpf_object {
            self.ebpf_object = path.clone();
        }
        if let Some(mode) = cli.xdp_mode {
            self.xdp_mode = mode;
        }
        if !cli.hooks.is_empty() {
            self.hooks = cli.hooks.clone();
        }
        if cli.json {
            self.json = true;
        }
        if let Some(seconds) = cli.stats_interval {
            self.stats_interval_seconds = seconds;
        }
        if cli.quiet {
            self.quiet = true;
        }
    }

    pub fn hook_enabled(&self, hook: HookPoint) -> bool {
        self.hooks.contains(&hook)
    }
}

/// Accepts `NIC_RX` style names and program names alike.
pub fn parse_hook(s: &str) -> Result<HookPoint, String> {
    s.parse::<HookPoint>().map_err(|e| e.to_string())
}

/// rxtrace: per-stage receive-path instrumentation
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: CliArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load the probes and stream records (the default).
    Run(CliArgs),
    /// Run the in-path pipeline over a capture file on the host.
    Replay(ReplayArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CliArgs {
    /// Network interface to attach the XDP program to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Compiled eBPF object to load.
    #[arg(long)]
    pub ebpf_object: Option<PathBuf>,

    /// XDP attach mode.
    #[arg(long, value_enum)]
    pub xdp_mode: Option<XdpMode>,

    /// Hook points to attach, comma separated (default: all).
    #[arg(long, value_delimiter = ',', value_parser = parse_hook)]
    pub hooks: Vec<HookPoint>,

    /// Print records as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// Seconds between counter reports (0 = disabled).
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Capture file (pcap) with Ethernet frames.
    pub pcap: PathBuf,

    /// Hook points to simulate, repeatable (default: all).
    #[arg(long = "hook", value_parser = parse_hook)]
    pub hooks: Vec<HookPoint>,

    /// Print records as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// Size of the host ring in bytes.
    #[arg(long, default_value_t = RING_BUF_BYTES as usize)]
    pub ring_bytes: usize,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}
