use anyhow::Context as _;
use aya::maps::Array;
use aya::programs::{KProbe, Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{debug, info, warn};

use crate::config::{Config, XdpMode};
use rxtrace_common::{HookPoint, SkbLayout};

impl XdpMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Default => XdpFlags::default(),
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Drv => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}

/// Loads the object, publishes the `sk_buff` layout and attaches every
/// configured hook. Returns the loaded object (dropping it detaches all
/// programs) and the hooks that are actually live.
pub fn load_and_attach(config: &Config) -> anyhow::Result<(Ebpf, Vec<HookPoint>)> {
    let mut bpf = Ebpf::load_file(&config.ebpf_object).with_context(|| {
        format!(
            "failed to load eBPF object {} (build it with `cargo xtask build-ebpf --release`)",
            config.ebpf_object.display()
        )
    })?;

    write_skb_layout(&mut bpf, config.skb_layout)?;

    let mut attached = Vec::new();
    for hook in HookPoint::ALL {
        if !config.hook_enabled(hook) {
            debug!("{} disabled by configuration", hook);
            continue;
        }
        match hook {
            HookPoint::NicRx => {
                let iface = config.interface.as_deref().unwrap_or("eth0");
                attach_xdp(&mut bpf, iface, config.xdp_mode)?;
                attached.push(hook);
            }
            _ => match attach_kprobe(&mut bpf, hook) {
                Ok(()) => attached.push(hook),
                // Missing or inlined symbols (ip_rcv_finish is often inlined).
                Err(e) => warn!("{} not attached: {:#}", hook, e),
            },
        }
    }

    anyhow::ensure!(!attached.is_empty(), "no hook point could be attached");
    Ok((bpf, attached))
}

fn write_skb_layout(bpf: &mut Ebpf, layout: SkbLayout) -> anyhow::Result<()> {
    let mut map: Array<_, SkbLayout> = Array::try_from(
        bpf.map_mut("SKB_LAYOUT")
            .context("SKB_LAYOUT map not found in eBPF object")?,
    )?;
    map.set(0, layout, 0).context("failed to write SKB_LAYOUT")?;
    debug!(?layout, "sk_buff layout published");
    Ok(())
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> anyhow::Result<()> {
    let program: &mut Xdp = bpf
        .program_mut(HookPoint::NicRx.program_name())
        .context("nic_rx program not found in eBPF object")?
        .try_into()
        .context("nic_rx is not an XDP program")?;
    program.load().context("failed to load nic_rx")?;
    program.attach(iface, mode.flags()).with_context(|| {
        format!("failed to attach nic_rx to {iface} ({mode:?} mode), try --xdp-mode skb")
    })?;
    info!("XDP program nic_rx attached to {} ({:?} mode)", iface, mode);
    Ok(())
}

fn attach_kprobe(bpf: &mut Ebpf, hook: HookPoint) -> anyhow::Result<()> {
    let name = hook.program_name();
    let program: &mut KProbe = bpf
        .program_mut(name)
        .with_context(|| format!("{name} program not found in eBPF object"))?
        .try_into()
        .with_context(|| format!("{name} is not a kprobe"))?;
    program
        .load()
        .with_context(|| format!("failed to load {name}"))?;
    // Program names match the kernel functions they probe.
    program
        .attach(name, 0)
        .with_context(|| format!("failed to attach kprobe to {name}"))?;
    info!("kprobe attached to {}", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdp_flags() {
        assert_eq!(XdpMode::Default.flags().bits(), XdpFlags::default().bits());
        assert_eq!(XdpMode::Skb.flags().bits(), XdpFlags::SKB_MODE.bits());
        assert_eq!(XdpMode::Drv.flags().bits(), XdpFlags::DRV_MODE.bits());
        assert_eq!(XdpMode::Hw.flags().bits(), XdpFlags::HW_MODE.bits());
    }

    #[test]
    fn test_missing_object_names_path() {
        let config = Config {
            ebpf_object: "/nonexistent/rxtrace.o".into(),
            ..Default::default()
        };
        let err = load_and_attach(&config).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/rxtrace.o"));
    }
}
