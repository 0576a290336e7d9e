use thiserror::Error;

/// Failures that prevent the profiler from starting or finishing a run.
///
/// Per-record problems are not errors: malformed records are logged and
/// skipped, unresolvable samples are dropped silently.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the arm_spe_0 PMU is not available on this system: {0}")]
    SpeDeviceUnavailable(#[source] std::io::Error),

    #[error("unsupported CPU part 0x{0:x}")]
    UnsupportedCpuPart(u64),

    #[error("perf_event_open failed on CPU {cpu}: {source}")]
    PerfEventOpen {
        cpu: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map the perf ring buffers on CPU {cpu}: {source}")]
    RingMmap {
        cpu: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure the perf events on CPU {cpu}: {source}")]
    EventSetup {
        cpu: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install the termination handler: {0}")]
    Signal(#[from] ctrlc::Error),
}
