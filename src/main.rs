mod branch_map;
mod cli;
mod error;
mod file_registry;
mod lat_map;
mod perf_event;
mod proc_maps;
mod process_maps;
mod profiler;
mod raw_data;
mod records;
mod ring;
mod spe;
mod sys;
mod sys_info;

use clap::Parser;
use log::debug;

use crate::profiler::Profiler;
use crate::sys_info::SystemConfig;

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();
    debug!(
        "configuration: {opt:?} (num_to_report is consumed by the offline report step)"
    );

    let sys = match SystemConfig::discover() {
        Ok(sys) => sys,
        Err(err) => {
            eprintln!("hotline: {err}");
            std::process::exit(1);
        }
    };
    debug!(
        "cpu part 0x{:x}, {} CPUs, {} Hz",
        sys.cpu_part, sys.num_cpus, sys.frequency
    );

    let mut profiler = match Profiler::new(&opt, sys) {
        Ok(profiler) => profiler,
        Err(err) => {
            eprintln!("hotline: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = profiler.run() {
        eprintln!("hotline: {err}");
        std::process::exit(1);
    }

    if let Err(err) = profiler.write_reports() {
        eprintln!("hotline: failed to write the aggregated maps: {err}");
        std::process::exit(1);
    }
}
