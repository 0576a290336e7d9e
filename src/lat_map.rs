//! Aggregation of latency-bearing SPE samples by file location.

use std::collections::BTreeMap;
use std::io::{self, Write};

use log::warn;

use crate::file_registry::{FileRegistry, SampleKey};
use crate::spe::{CompletionTier, SpePacket};
use crate::sys_info::LatencyLimits;

pub const TIER_COUNT: usize = 4;

/// Execution-latency histogram of the samples one completion tier served.
/// Each bucket counts samples whose execution latency fell at or below the
/// corresponding cache-level cap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompletionHistogram {
    pub l1_bound: u64,
    pub l2_bound: u64,
    pub l3_bound: u64,
    pub dram_bound: u64,
}

impl CompletionHistogram {
    fn merge(&mut self, other: &CompletionHistogram) {
        self.l1_bound += other.l1_bound;
        self.l2_bound += other.l2_bound;
        self.l3_bound += other.l3_bound;
        self.dram_bound += other.dram_bound;
    }
}

/// Accumulated latency statistics for one `(file, offset)` location.
/// Latencies are in picoseconds; one histogram per completion tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub total_latency: u64,
    pub issue_latency: u64,
    pub translation_latency: u64,
    pub saturated: u64,
    pub histograms: [CompletionHistogram; TIER_COUNT],
}

impl LatencyStats {
    /// Converts one decoded packet into a single-sample delta.
    ///
    /// A saturated sample carries no usable latency counters: it only
    /// bumps `count` and `saturated`.
    pub fn from_packet(packet: &SpePacket, cyc_to_ps: u64, limits: &LatencyLimits) -> LatencyStats {
        let mut stats = LatencyStats {
            count: 1,
            ..LatencyStats::default()
        };

        if packet.is_saturated() {
            stats.saturated = 1;
            return stats;
        }

        stats.total_latency = packet.total_lat as u64 * cyc_to_ps;
        stats.issue_latency = packet.issue_lat as u64 * cyc_to_ps;
        stats.translation_latency = packet.translation_lat as u64 * cyc_to_ps;

        let tier = CompletionTier::from_data_source(packet.data_source);
        let histogram = &mut stats.histograms[tier as usize];

        // The hardware can report issue + translation above the total on
        // malformed samples; clamp instead of wrapping.
        let execution_latency = stats
            .total_latency
            .saturating_sub(stats.issue_latency)
            .saturating_sub(stats.translation_latency);

        if execution_latency <= limits.l1_cap_ps {
            histogram.l1_bound = 1;
        } else if execution_latency <= limits.l2_cap_ps {
            histogram.l2_bound = 1;
        } else if execution_latency <= limits.l3_cap_ps {
            histogram.l3_bound = 1;
        } else {
            histogram.dram_bound = 1;
        }

        stats
    }

    fn merge(&mut self, other: &LatencyStats) {
        self.count += other.count;
        self.total_latency += other.total_latency;
        self.issue_latency += other.issue_latency;
        self.translation_latency += other.translation_latency;
        self.saturated += other.saturated;
        for (histogram, incoming) in self.histograms.iter_mut().zip(other.histograms.iter()) {
            histogram.merge(incoming);
        }
    }
}

#[derive(Debug, Default)]
pub struct LatencyMap {
    entries: BTreeMap<SampleKey, LatencyStats>,
}

impl LatencyMap {
    pub fn new() -> LatencyMap {
        LatencyMap::default()
    }

    pub fn record(&mut self, key: SampleKey, stats: &LatencyStats) {
        self.entries.entry(key).or_default().merge(stats);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &SampleKey) -> Option<&LatencyStats> {
        self.entries.get(key)
    }

    /// Writes the map in key order. Filenames come back from the registry
    /// only here, so the sample path stayed free of strings.
    pub fn write_csv<W: Write>(&self, mut out: W, files: &FileRegistry) -> io::Result<()> {
        writeln!(
            out,
            "filename,offset,count,total_latency,issue_latency,translation_latency,\
             l1_bin1,l1_bin2,l1_bin3,l1_bin4,\
             l2_bin1,l2_bin2,l2_bin3,l2_bin4,\
             l3_bin1,l3_bin2,l3_bin3,l3_bin4,\
             dram_bin1,dram_bin2,dram_bin3,dram_bin4,saturated"
        )?;

        for (key, stats) in &self.entries {
            let Some(filename) = files.path_of(&key.file_id) else {
                warn!(
                    "no filename registered for inode {} ({}:{}); dropping latency entry",
                    key.file_id.inode, key.file_id.major, key.file_id.minor
                );
                continue;
            };

            write!(
                out,
                "{},0x{:x},{},{},{},{}",
                filename,
                key.offset,
                stats.count,
                stats.total_latency,
                stats.issue_latency,
                stats.translation_latency
            )?;
            for histogram in &stats.histograms {
                write!(
                    out,
                    ",{},{},{},{}",
                    histogram.l1_bound, histogram.l2_bound, histogram.l3_bound, histogram.dram_bound
                )?;
            }
            writeln!(out, ",{}", stats.saturated)?;
        }

        Ok(())
    }
}
