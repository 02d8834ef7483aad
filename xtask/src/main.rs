use std::process::Command;

use anyhow::Context as _;
use clap::{Args, Parser};

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the probe object for bpfel-unknown-none.
    BuildEbpf(Profile),
    /// Build the probes, then the agent.
    Build(BuildArgs),
    /// Build everything and run the agent with sudo.
    Run {
        #[command(flatten)]
        build: BuildArgs,
        /// Arguments passed to rxtrace.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Clone, Copy)]
struct Profile {
    /// Build in release mode.
    #[arg(long)]
    release: bool,
}

impl Profile {
    fn dir(self) -> &'static str {
        if self.release {
            "release"
        } else {
            "debug"
        }
    }
}

#[derive(Args, Clone, Copy)]
struct BuildArgs {
    #[command(flatten)]
    profile: Profile,
    /// Enable pcap replay in the agent (needs libpcap).
    #[arg(long)]
    replay: bool,
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf(profile) => build_ebpf(profile),
        Cli::Build(build) => {
            build_ebpf(build.profile)?;
            build_agent(build)
        }
        Cli::Run { build, args } => {
            build_ebpf(build.profile)?;
            build_agent(build)?;
            run(build.profile, &args)
        }
    }
}

fn build_ebpf(profile: Profile) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../rxtrace-ebpf"));
    cmd.args(["+nightly", "build", "--target", EBPF_TARGET, "-Z", "build-std=core"]);
    if profile.release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for rxtrace-ebpf")?;
    anyhow::ensure!(status.success(), "rxtrace-ebpf build failed");
    Ok(())
}

fn build_agent(build: BuildArgs) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--workspace"]);
    if build.profile.release {
        cmd.arg("--release");
    }
    if build.replay {
        cmd.args(["--features", "rxtrace/replay"]);
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for the workspace")?;
    anyhow::ensure!(status.success(), "workspace build failed");
    Ok(())
}

fn run(profile: Profile, extra_args: &[String]) -> anyhow::Result<()> {
    let bin = format!("target/{}/rxtrace", profile.dir());
    let object = format!("rxtrace-ebpf/target/{EBPF_TARGET}/{}/rxtrace", profile.dir());

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    cmd.args(extra_args);
    // Point the agent at the object built with the same profile.
    let is_replay = extra_args.first().map(String::as_str) == Some("replay");
    if !is_replay && !extra_args.iter().any(|a| a == "--ebpf-object") {
        cmd.arg("--ebpf-object").arg(object);
    }
    let status = cmd.status().context("failed to run rxtrace")?;
    anyhow::ensure!(status.success(), "rxtrace exited with error");
    Ok(())
}
