use std::path::PathBuf;

use clap::Parser;

/// Maximum SPE sampling frequency the hardware supports, in Hz.
const MAX_SAMPLE_FREQUENCY: u32 = 4096;

#[derive(Debug, Parser)]
#[command(
    name = "hotline",
    version,
    about = "\
hotline profiles every CPU through the Arm Statistical Profiling Extension and
aggregates instruction latency and branch-miss statistics by file and offset.

The aggregated maps are written to the data directory as
hotline_lat_map.csv and hotline_bmiss_map.csv; report generation consumes
them offline."
)]
pub struct Opt {
    /// Seconds to sleep between ring-buffer drain passes.
    #[arg(long = "wakeup_period", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub wakeup_period: u32,

    /// SPE sampling frequency in Hz.
    #[arg(long = "hotline_frequency", default_value_t = 1000,
          value_parser = clap::value_parser!(u32).range(1..=MAX_SAMPLE_FREQUENCY as i64))]
    pub hotline_frequency: u32,

    /// Total profiling duration in seconds.
    #[arg(long = "timeout", default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub timeout: u32,

    /// Directory the aggregated CSV maps are written to.
    #[arg(long = "data_dir", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Number of entries the offline report step keeps per map.
    #[arg(long = "num_to_report", default_value_t = 1000)]
    pub num_to_report: u32,
}
