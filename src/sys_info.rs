//! System discovery: which CPU this is, how fast it runs, where its cache
//! latency boundaries sit, and how large the per-CPU ring buffers need to
//! be for the configured wakeup period.

use std::fs;

use crate::error::Error;

pub const CPU_PART_GRAVITON2: u64 = 0xd0c;
pub const CPU_PART_GRAVITON3: u64 = 0xd40;
pub const CPU_PART_GRAVITON4: u64 = 0xd4f;

const SECOND_TO_PS: u64 = 1_000_000_000_000;

/// Size of a SWITCH_CPU_WIDE record including its sample_id trailer; the
/// record ring is sized off the context-switch rate.
const SWITCH_RECORD_SIZE: u64 = 48;

/// Size of one raw SPE sample in the aux ring.
const SPE_RECORD_SIZE: u64 = 64;

/// Execution-latency boundaries between completion tiers, in picoseconds.
/// Measured with lat_mem_rd per CPU generation.
#[derive(Debug, Clone, Copy)]
pub struct LatencyLimits {
    pub l1_cap_ps: u64,
    pub l2_cap_ps: u64,
    pub l3_cap_ps: u64,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub cpu_part: u64,
    pub page_size: u64,
    pub frequency: u64,
    pub num_cpus: usize,
    pub latency_limits: LatencyLimits,
    pub perf_event_type: u32,
    /// Picoseconds per CPU cycle. Picosecond granularity keeps the
    /// sub-nanosecond part without floating point on the sample path.
    pub cyc_to_ps: u64,
}

impl SystemConfig {
    pub fn discover() -> Result<SystemConfig, Error> {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        let cpu_part = parse_cpu_part(&cpuinfo).unwrap_or(CPU_PART_GRAVITON4);
        let frequency = frequency_for_part(cpu_part)?;
        let latency_limits = latency_limits_for_part(cpu_part)?;
        let perf_event_type = read_spe_event_type()?;
        let page_size = page_size();

        Ok(SystemConfig {
            cpu_part,
            page_size,
            frequency,
            num_cpus: num_cpus::get(),
            latency_limits,
            perf_event_type,
            cyc_to_ps: SECOND_TO_PS / frequency,
        })
    }
}

fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Scans `/proc/cpuinfo` for the `CPU part` line.
fn parse_cpu_part(cpuinfo: &str) -> Option<u64> {
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("CPU part") {
            let value = rest.trim_start().strip_prefix(':')?.trim();
            let value = value.strip_prefix("0x")?;
            return u64::from_str_radix(value, 16).ok();
        }
    }
    None
}

fn frequency_for_part(cpu_part: u64) -> Result<u64, Error> {
    match cpu_part {
        CPU_PART_GRAVITON2 => Ok(2_500_000_000),
        CPU_PART_GRAVITON3 => Ok(2_600_000_000),
        CPU_PART_GRAVITON4 => Ok(2_800_000_000),
        other => Err(Error::UnsupportedCpuPart(other)),
    }
}

fn latency_limits_for_part(cpu_part: u64) -> Result<LatencyLimits, Error> {
    match cpu_part {
        CPU_PART_GRAVITON2 | CPU_PART_GRAVITON3 => Ok(LatencyLimits {
            l1_cap_ps: 1800,
            l2_cap_ps: 5700,
            l3_cap_ps: 34000,
        }),
        CPU_PART_GRAVITON4 => Ok(LatencyLimits {
            l1_cap_ps: 1500,
            l2_cap_ps: 5000,
            l3_cap_ps: 31000,
        }),
        other => Err(Error::UnsupportedCpuPart(other)),
    }
}

/// The dynamic perf event type id of the SPE PMU. Its absence means the
/// hardware (or the kernel driver) cannot support this profiler at all.
fn read_spe_event_type() -> Result<u32, Error> {
    let text =
        fs::read_to_string("/sys/devices/arm_spe_0/type").map_err(Error::SpeDeviceUnavailable)?;
    text.trim()
        .parse::<u32>()
        .map_err(|_| Error::SpeDeviceUnavailable(std::io::ErrorKind::InvalidData.into()))
}

/// Ring sizes for one CPU session. Both data regions are powers of two as
/// perf_event_open requires; the record ring additionally carries the one
/// metadata page.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizes {
    pub record_buf: u64,
    pub aux_buf: u64,
    pub aux_offset: u64,
}

pub fn perf_buffer_sizes(
    sys: &SystemConfig,
    wakeup_period: u32,
    hotline_frequency: u32,
) -> BufferSizes {
    // The record stream rate is dominated by context switches, which are
    // independent of the sampling period and hard to predict, so the ring
    // is statically large and scales only with the wakeup period.
    let record_data = 16 * sys.page_size * SWITCH_RECORD_SIZE * wakeup_period as u64;
    // 4x overestimate over the expected sample count between wakeups.
    let aux_data =
        hotline_frequency as u64 * wakeup_period as u64 * SPE_RECORD_SIZE * 4;

    let record_buf = record_data.next_power_of_two() + sys.page_size;
    let aux_buf = aux_data.next_power_of_two();
    let aux_offset = record_buf + sys.page_size;

    BufferSizes {
        record_buf,
        aux_buf,
        aux_offset,
    }
}
