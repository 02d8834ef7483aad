use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use aya::maps::{MapData, PerCpuArray};
use rxtrace_common::{EmitStats, HookPoint, PacketEvent};

/// Counters over the decoded record stream.
pub struct StreamStats {
    /// Indexed by hook tag, slot 0 unused.
    per_hook: [AtomicU64; 6],
    pub per_cpu: DashMap<u32, u64>,
    pub total_records: AtomicU64,
    pub total_bytes: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_records: u64,
    pub total_bytes: u64,
    pub malformed: u64,
    pub per_hook: Vec<(HookPoint, u64)>,
    pub per_cpu: Vec<(u32, u64)>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            per_hook: Default::default(),
            per_cpu: DashMap::new(),
            total_records: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn update(&self, event: &PacketEvent) {
        if let Some(counter) = self.per_hook.get(event.hook_point as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        *self.per_cpu.entry(event.cpu_id).or_insert(0) += 1;
        self.total_records.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(event.length as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hook_count(&self, hook: HookPoint) -> u64 {
        self.per_hook[hook.tag() as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut per_cpu: Vec<(u32, u64)> = self
            .per_cpu
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        per_cpu.sort_unstable();
        StatsSnapshot {
            total_records: self.total_records.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            per_hook: HookPoint::ALL
                .into_iter()
                .map(|hook| (hook, self.hook_count(hook)))
                .collect(),
            per_cpu,
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds the per-CPU slots of one hook into a single total.
pub fn sum_emit_stats<I: IntoIterator<Item = EmitStats>>(values: I) -> EmitStats {
    values
        .into_iter()
        .fold(EmitStats::default(), |acc, v| EmitStats {
            published: acc.published + v.published,
            dropped: acc.dropped + v.dropped,
        })
}

/// Kernel-side emission counters, summed over CPUs, per hook.
pub fn read_emit_stats(
    map: &PerCpuArray<MapData, EmitStats>,
) -> anyhow::Result<Vec<(HookPoint, EmitStats)>> {
    HookPoint::ALL
        .into_iter()
        .map(|hook| {
            let values = map.get(&(hook.tag() as u32), 0)?;
            Ok((hook, sum_emit_stats(values.iter().copied())))
        })
        .collect()
}

pub fn log_report(kernel: &[(HookPoint, EmitStats)], stream: &StatsSnapshot) {
    for (hook, stats) in kernel {
        if stats.published == 0 && stats.dropped == 0 {
            continue;
        }
        tracing::info!(
            hook = %hook,
            published = stats.published,
            dropped = stats.dropped,
            "kernel emit counters"
        );
    }
    tracing::info!(
        records = stream.total_records,
        bytes = stream.total_bytes,
        malformed = stream.malformed,
        cpus = stream.per_cpu.len(),
        "stream totals"
    );
}
