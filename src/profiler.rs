//! The supervisor: owns the per-CPU sessions and the process-global
//! directories and stores, seeds the directories from `/proc`, and drives
//! the drain loop.
//!
//! Draining is sample-led: for each SPE packet (in aux-buffer order) the
//! record stream is pumped forward just far enough that every MMAP2, EXIT
//! and SWITCH record with a timestamp at or before the sample has been
//! applied. The sample is then resolved against exactly the scheduling and
//! mapping state that was live when the hardware captured it.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::NativeEndian;
use log::{debug, error, info, warn};

use crate::branch_map::{BranchMissMap, BranchStats};
use crate::cli::Opt;
use crate::error::Error;
use crate::file_registry::{file_id_for_path, FileRegistry, SampleKey};
use crate::lat_map::{LatencyMap, LatencyStats};
use crate::perf_event::CpuSession;
use crate::proc_maps;
use crate::process_maps::{ProcessMaps, Segment};
use crate::records::{self, Mmap2Record, Record};
use crate::ring;
use crate::spe::{SpePacket, PACKET_TYPE_BRANCH, PACKET_TYPE_LATENCY, SPE_PACKET_SIZE};
use crate::sys::*;
use crate::sys_info::{perf_buffer_sizes, SystemConfig};

pub const LAT_MAP_FILENAME: &str = "hotline_lat_map.csv";
pub const BMISS_MAP_FILENAME: &str = "hotline_bmiss_map.csv";

/// Receiver for the state effects of the record stream.
trait RecordSink {
    fn mmap2(&mut self, record: &Mmap2Record);
    fn process_exit(&mut self, pid: i32);
    fn switch_in(&mut self, pid: i32);
}

/// Applies record effects against the live directories and the session's
/// active-PID slot (tracked by value so the ring slice can stay borrowed).
struct SessionEffects<'a> {
    active_pid: i32,
    maps: &'a mut ProcessMaps,
    files: &'a mut FileRegistry,
}

impl RecordSink for SessionEffects<'_> {
    fn mmap2(&mut self, record: &Mmap2Record) {
        let path = record.path.as_slice();
        let path = String::from_utf8_lossy(&path);
        self.files.register(record.file_id, &path);
        self.maps.insert_segment(
            record.pid,
            Segment {
                start: record.address,
                end: record.address + record.length,
                file_offset: record.page_offset,
                file_id: record.file_id,
            },
        );
    }

    fn process_exit(&mut self, pid: i32) {
        self.maps.remove(pid);
    }

    fn switch_in(&mut self, pid: i32) {
        self.active_pid = pid;
    }
}

/// Walks the record stream from `tail`, applying every record whose
/// timestamp is at or before `target_ts` (timestamp-0 records carry no
/// ordering constraint and are applied as encountered). Returns the new
/// tail and the timestamp of the last record applied.
fn pump_records(
    data: &[u8],
    head: u64,
    tail: u64,
    target_ts: u64,
    sink: &mut impl RecordSink,
) -> (u64, u64) {
    let size = data.len() as u64;
    let mut tail = tail;
    let mut last_ts = 0;

    if head.saturating_sub(tail) > size {
        // Overrun: everything between the old tail and head - size has
        // been overwritten and must not be dereferenced.
        warn!(
            "record ring overrun, dropping {} bytes",
            head - size - tail
        );
        tail = head - size;
    }

    loop {
        let Some(location) = ring::peek_record(data, head, tail) else {
            break;
        };
        if (location.len as u64) < ring::RECORD_HEADER_SIZE {
            warn!(
                "malformed record header (kind {}, size {}); resyncing to head",
                location.kind, location.len
            );
            tail = head;
            break;
        }

        let ts = records::record_timestamp::<NativeEndian>(location.kind, location.data.get(data));
        if ts > target_ts {
            break;
        }

        if matches!(
            location.kind,
            PERF_RECORD_NAMESPACES..=PERF_RECORD_TEXT_POKE
        ) {
            // Not subscribed; seeing one means the event configuration is
            // not what we set up.
            error!("unexpected record kind {} in stream", location.kind);
        } else {
            match records::parse_record::<NativeEndian>(location.kind, location.data.get(data)) {
                Ok(Record::Mmap2(record)) => sink.mmap2(&record),
                Ok(Record::Exit(record)) => sink.process_exit(record.pid),
                Ok(Record::SwitchCpuWide(record)) => {
                    // Only the switch-out edge carries the incoming PID.
                    if location.misc & PERF_RECORD_MISC_SWITCH_OUT != 0 {
                        sink.switch_in(record.next_prev_pid);
                    }
                }
                Ok(Record::Other) => {}
                Err(err) => warn!(
                    "skipping malformed record (kind {}): {err}",
                    location.kind
                ),
            }
        }

        if ts != 0 {
            last_ts = ts;
        }
        tail += location.len as u64;
    }

    (tail, last_ts)
}

fn pump_session_records(
    session: &mut CpuSession,
    target_ts: u64,
    maps: &mut ProcessMaps,
    files: &mut FileRegistry,
) {
    let head = session.record_head();
    let mut effects = SessionEffects {
        active_pid: session.active_pid,
        maps,
        files,
    };
    let (tail, last_ts) = pump_records(
        session.record_data(),
        head,
        session.record_tail,
        target_ts,
        &mut effects,
    );
    session.active_pid = effects.active_pid;
    if last_ts != 0 {
        session.last_record_ts = last_ts;
    }
    session.publish_record_tail(tail);
}

/// Resolves a decoded sample and folds it into the store its packet type
/// selects. Unresolvable samples (unknown PID, unmapped PC, anonymous
/// mapping) are dropped; that is expected during warm-up and for kernel
/// or JIT code.
fn handle_packet(
    packet: &SpePacket,
    active_pid: i32,
    maps: &mut ProcessMaps,
    latency: &mut LatencyMap,
    branches: &mut BranchMissMap,
    sys: &SystemConfig,
) {
    let Some((file_id, offset)) = maps.resolve(packet.pc, active_pid) else {
        return;
    };
    let key = SampleKey { file_id, offset };

    match packet.kind {
        PACKET_TYPE_LATENCY => latency.record(
            key,
            &LatencyStats::from_packet(packet, sys.cyc_to_ps, &sys.latency_limits),
        ),
        PACKET_TYPE_BRANCH => branches.record(key, &BranchStats::from_packet(packet)),
        _ => {}
    }
}

fn drain_session(
    session: &mut CpuSession,
    maps: &mut ProcessMaps,
    files: &mut FileRegistry,
    latency: &mut LatencyMap,
    branches: &mut BranchMissMap,
    sys: &SystemConfig,
) {
    let aux_head = session.aux_head();
    let mut aux_tail = session.aux_tail;

    // Leave one packet of slack: SPE can retire a sample just ahead of the
    // SWITCH record describing the process it belongs to.
    while aux_tail + 2 * SPE_PACKET_SIZE as u64 <= aux_head {
        let mut bytes = [0u8; SPE_PACKET_SIZE];
        ring::read_wrapped(session.aux_data(), aux_tail, &mut bytes);
        let packet = SpePacket::parse(&bytes);

        let perf_ts = session.tsc.to_perf_time(packet.timestamp);
        if perf_ts >= session.last_aux_ts {
            pump_session_records(session, perf_ts, maps, files);
            handle_packet(&packet, session.active_pid, maps, latency, branches, sys);
            session.last_aux_ts = perf_ts;
        }
        // else: out of order against this session; rare SPE reordering,
        // skip the packet.

        aux_tail += SPE_PACKET_SIZE as u64;
        session.publish_aux_tail(aux_tail);
    }
}

pub struct Profiler {
    sessions: Vec<CpuSession>,
    maps: ProcessMaps,
    files: FileRegistry,
    latency: LatencyMap,
    branches: BranchMissMap,
    sys: SystemConfig,
    wakeup_period: Duration,
    timeout: Duration,
    data_dir: PathBuf,
}

impl Profiler {
    pub fn new(opt: &Opt, sys: SystemConfig) -> Result<Profiler, Error> {
        let sizes = perf_buffer_sizes(&sys, opt.wakeup_period, opt.hotline_frequency);
        let sample_period = sys.frequency / opt.hotline_frequency as u64;

        let mut sessions = Vec::with_capacity(sys.num_cpus);
        for cpu in 0..sys.num_cpus as u32 {
            sessions.push(CpuSession::open(cpu, &sys, &sizes, sample_period)?);
        }

        let mut profiler = Profiler {
            sessions,
            maps: ProcessMaps::new(),
            files: FileRegistry::new(),
            latency: LatencyMap::new(),
            branches: BranchMissMap::new(),
            sys,
            wakeup_period: Duration::from_secs(opt.wakeup_period as u64),
            timeout: Duration::from_secs(opt.timeout as u64),
            data_dir: opt.data_dir.clone(),
        };
        profiler.bootstrap_from_proc();
        Ok(profiler)
    }

    /// The kernel only emits MMAP2 records for mappings created after the
    /// events are enabled. Everything already running is seeded from
    /// `/proc/<pid>/maps`, through the same insertion path the records
    /// take.
    fn bootstrap_from_proc(&mut self) {
        let Ok(entries) = fs::read_dir("/proc") else {
            warn!("cannot read /proc; starting with an empty mapping directory");
            return;
        };

        let mut processes = 0u64;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
                continue;
            };
            // Processes racing to exit while we scan are skipped.
            let Ok(maps_text) = fs::read_to_string(format!("/proc/{pid}/maps")) else {
                continue;
            };

            for region in proc_maps::parse(&maps_text) {
                if region.path.is_empty() {
                    continue;
                }
                let file_id = file_id_for_path(&region.path);
                self.files.register(file_id, &region.path);
                self.maps.insert_segment(
                    pid,
                    Segment {
                        start: region.start,
                        end: region.end,
                        file_offset: region.file_offset,
                        file_id,
                    },
                );
            }
            processes += 1;
        }
        debug!("bootstrap: seeded mappings for {processes} running processes");
    }

    pub fn run(&mut self) -> Result<(), Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

        for session in &self.sessions {
            session.enable().map_err(|source| Error::EventSetup {
                cpu: session.cpu,
                source,
            })?;
        }
        info!(
            "profiling {} CPUs for up to {:?}",
            self.sessions.len(),
            self.timeout
        );

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
            thread::sleep(self.wakeup_period);

            let Profiler {
                sessions,
                maps,
                files,
                latency,
                branches,
                sys,
                ..
            } = self;
            for session in sessions.iter_mut() {
                drain_session(session, maps, files, latency, branches, sys);
            }
        }

        info!(
            "profiling finished: {} latency locations, {} branch locations",
            self.latency.len(),
            self.branches.len()
        );
        Ok(())
    }

    pub fn write_reports(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;

        let lat_file = File::create(self.data_dir.join(LAT_MAP_FILENAME))?;
        self.latency
            .write_csv(BufWriter::new(lat_file), &self.files)?;

        let bmiss_file = File::create(self.data_dir.join(BMISS_MAP_FILENAME))?;
        self.branches
            .write_csv(BufWriter::new(bmiss_file), &self.files)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_registry::FileId;
    use crate::records::tests::{exit_payload, mmap2_payload, switch_payload};
    use crate::spe::DATA_SOURCE_L1;
    use crate::sys_info::{LatencyLimits, SystemConfig, CPU_PART_GRAVITON2};
    use byteorder::{NativeEndian as NE, WriteBytesExt};

    fn frame(kind: u32, misc: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_u32::<NE>(kind).unwrap();
        bytes.write_u16::<NE>(misc).unwrap();
        bytes
            .write_u16::<NE>((8 + payload.len()) as u16)
            .unwrap();
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Lays records into a power-of-two ring starting at position 0 and
    /// returns the buffer plus the producer head.
    fn ring_with(records: &[Vec<u8>]) -> (Vec<u8>, u64) {
        let total: usize = records.iter().map(|r| r.len()).sum();
        let size = total.next_power_of_two().max(64);
        let mut buffer = vec![0u8; size];
        let mut head = 0usize;
        for record in records {
            buffer[head..head + record.len()].copy_from_slice(record);
            head += record.len();
        }
        (buffer, head as u64)
    }

    #[derive(Default)]
    struct RecordingSink {
        mmaps: Vec<(i32, u64)>,
        exits: Vec<i32>,
        switches: Vec<i32>,
    }

    impl RecordSink for RecordingSink {
        fn mmap2(&mut self, record: &Mmap2Record) {
            self.mmaps.push((record.pid, record.address));
        }
        fn process_exit(&mut self, pid: i32) {
            self.exits.push(pid);
        }
        fn switch_in(&mut self, pid: i32) {
            self.switches.push(pid);
        }
    }

    fn file_id() -> FileId {
        FileId {
            major: 8,
            minor: 1,
            inode: 42,
            generation: 0,
        }
    }

    fn test_sys() -> SystemConfig {
        SystemConfig {
            cpu_part: CPU_PART_GRAVITON2,
            page_size: 4096,
            frequency: 2_500_000_000,
            num_cpus: 1,
            latency_limits: LatencyLimits {
                l1_cap_ps: 1800,
                l2_cap_ps: 5700,
                l3_cap_ps: 34000,
            },
            perf_event_type: 8,
            cyc_to_ps: 400,
        }
    }

    #[test]
    fn pump_stops_at_target_timestamp() {
        let (buffer, head) = ring_with(&[
            frame(
                PERF_RECORD_SWITCH_CPU_WIDE,
                PERF_RECORD_MISC_SWITCH_OUT,
                &switch_payload(200, 1000),
            ),
            frame(
                PERF_RECORD_SWITCH_CPU_WIDE,
                PERF_RECORD_MISC_SWITCH_OUT,
                &switch_payload(300, 2000),
            ),
        ]);

        let mut sink = RecordingSink::default();
        let (tail, last_ts) = pump_records(&buffer, head, 0, 500, &mut sink);
        assert_eq!(tail, 0);
        assert_eq!(last_ts, 0);
        assert!(sink.switches.is_empty());

        let (tail, last_ts) = pump_records(&buffer, head, tail, 1500, &mut sink);
        assert_eq!(last_ts, 1000);
        assert_eq!(sink.switches, vec![200]);

        let (_, last_ts) = pump_records(&buffer, head, tail, 2500, &mut sink);
        assert_eq!(last_ts, 2000);
        assert_eq!(sink.switches, vec![200, 300]);
    }

    #[test]
    fn switch_in_direction_only_applies_on_switch_out_edge() {
        let (buffer, head) = ring_with(&[
            frame(PERF_RECORD_SWITCH_CPU_WIDE, 0, &switch_payload(200, 100)),
            frame(
                PERF_RECORD_SWITCH_CPU_WIDE,
                PERF_RECORD_MISC_SWITCH_OUT,
                &switch_payload(300, 200),
            ),
        ]);

        let mut sink = RecordingSink::default();
        pump_records(&buffer, head, 0, u64::MAX, &mut sink);
        assert_eq!(sink.switches, vec![300]);
    }

    #[test]
    fn timestampless_records_are_processed_unconditionally() {
        let (buffer, head) = ring_with(&[
            frame(
                PERF_RECORD_MMAP2,
                0,
                &mmap2_payload(100, 0x400000, 0x1000, 0, file_id(), "/usr/bin/cat", 0),
            ),
            frame(
                PERF_RECORD_SWITCH_CPU_WIDE,
                PERF_RECORD_MISC_SWITCH_OUT,
                &switch_payload(300, 2000),
            ),
        ]);

        let mut sink = RecordingSink::default();
        let (_, last_ts) = pump_records(&buffer, head, 0, 1000, &mut sink);
        assert_eq!(sink.mmaps, vec![(100, 0x400000)]);
        assert!(sink.switches.is_empty());
        assert_eq!(last_ts, 0);
    }

    #[test]
    fn exit_records_reach_the_sink() {
        let (buffer, head) = ring_with(&[frame(PERF_RECORD_EXIT, 0, &exit_payload(100, 50))]);
        let mut sink = RecordingSink::default();
        pump_records(&buffer, head, 0, 1000, &mut sink);
        assert_eq!(sink.exits, vec![100]);
    }

    #[test]
    fn overrun_clamps_tail_forward() {
        let (buffer, _) = ring_with(&[frame(
            PERF_RECORD_SWITCH_CPU_WIDE,
            PERF_RECORD_MISC_SWITCH_OUT,
            &switch_payload(200, 100),
        )]);
        let size = buffer.len() as u64;

        // Producer lapped us: pretend head raced far beyond the region.
        let head = size * 3;
        let mut sink = RecordingSink::default();
        let (tail, _) = pump_records(&buffer, head, 0, u64::MAX, &mut sink);
        assert!(tail >= head - size);
    }

    #[test]
    fn samples_resolve_against_the_pid_live_at_capture_time() {
        let mut maps = ProcessMaps::new();
        let mut files = FileRegistry::new();
        let mut latency = LatencyMap::new();
        let mut branches = BranchMissMap::new();
        let sys = test_sys();

        let other_file = FileId {
            inode: 43,
            ..file_id()
        };
        maps.insert_segment(
            100,
            Segment {
                start: 0x400000,
                end: 0x401000,
                file_offset: 0,
                file_id: file_id(),
            },
        );
        maps.insert_segment(
            200,
            Segment {
                start: 0x400000,
                end: 0x401000,
                file_offset: 0,
                file_id: other_file,
            },
        );

        let (buffer, head) = ring_with(&[frame(
            PERF_RECORD_SWITCH_CPU_WIDE,
            PERF_RECORD_MISC_SWITCH_OUT,
            &switch_payload(200, 1000),
        )]);

        let packet = SpePacket {
            pc: 0x4004c0,
            kind: PACKET_TYPE_LATENCY,
            branch_type: 0,
            events: 0,
            issue_lat: 10,
            total_lat: 20,
            translation_lat: 2,
            virtual_address: 0,
            data_source: DATA_SOURCE_L1,
            timestamp: 0,
        };

        // First sample at t=500: the switch at t=1000 must not yet apply.
        let mut effects = SessionEffects {
            active_pid: 100,
            maps: &mut maps,
            files: &mut files,
        };
        let (tail, _) = pump_records(&buffer, head, 0, 500, &mut effects);
        let active = effects.active_pid;
        handle_packet(&packet, active, &mut maps, &mut latency, &mut branches, &sys);

        // Second sample at t=1500: now it does.
        let mut effects = SessionEffects {
            active_pid: active,
            maps: &mut maps,
            files: &mut files,
        };
        pump_records(&buffer, head, tail, 1500, &mut effects);
        let active = effects.active_pid;
        assert_eq!(active, 200);
        handle_packet(&packet, active, &mut maps, &mut latency, &mut branches, &sys);

        let first_key = SampleKey {
            file_id: file_id(),
            offset: 0x4c0,
        };
        let second_key = SampleKey {
            file_id: other_file,
            offset: 0x4c0,
        };
        assert_eq!(latency.get(&first_key).unwrap().count, 1);
        assert_eq!(latency.get(&second_key).unwrap().count, 1);
    }

    #[test]
    fn exited_process_yields_no_samples() {
        let mut maps = ProcessMaps::new();
        let mut files = FileRegistry::new();
        let mut latency = LatencyMap::new();
        let mut branches = BranchMissMap::new();
        let sys = test_sys();

        maps.insert_segment(
            100,
            Segment {
                start: 0x400000,
                end: 0x401000,
                file_offset: 0,
                file_id: file_id(),
            },
        );

        let (buffer, head) = ring_with(&[frame(PERF_RECORD_EXIT, 0, &exit_payload(100, 100))]);
        let mut effects = SessionEffects {
            active_pid: 100,
            maps: &mut maps,
            files: &mut files,
        };
        pump_records(&buffer, head, 0, 1000, &mut effects);

        let packet = SpePacket {
            pc: 0x4004c0,
            kind: PACKET_TYPE_LATENCY,
            branch_type: 0,
            events: 0,
            issue_lat: 10,
            total_lat: 20,
            translation_lat: 2,
            virtual_address: 0,
            data_source: DATA_SOURCE_L1,
            timestamp: 0,
        };
        handle_packet(&packet, 100, &mut maps, &mut latency, &mut branches, &sys);

        assert!(latency.is_empty());
        assert!(branches.is_empty());
    }

    #[test]
    fn unmapped_pc_mutates_nothing() {
        let mut maps = ProcessMaps::new();
        let mut latency = LatencyMap::new();
        let mut branches = BranchMissMap::new();
        let sys = test_sys();

        maps.insert_segment(
            100,
            Segment {
                start: 0x400000,
                end: 0x401000,
                file_offset: 0,
                file_id: file_id(),
            },
        );

        let packet = SpePacket {
            pc: 0xdead0000,
            kind: PACKET_TYPE_BRANCH,
            branch_type: 1,
            events: 0,
            issue_lat: 0,
            total_lat: 0,
            translation_lat: 0,
            virtual_address: 0,
            data_source: 0,
            timestamp: 0,
        };
        handle_packet(&packet, 100, &mut maps, &mut latency, &mut branches, &sys);

        assert!(latency.is_empty());
        assert!(branches.is_empty());
    }

    #[test]
    fn mmap2_through_the_sink_updates_both_directories() {
        let mut maps = ProcessMaps::new();
        let mut files = FileRegistry::new();

        let (buffer, head) = ring_with(&[frame(
            PERF_RECORD_MMAP2,
            0,
            &mmap2_payload(100, 0x400000, 0x1000, 0x2000, file_id(), "/usr/lib/libc.so.6", 10),
        )]);
        let mut effects = SessionEffects {
            active_pid: -1,
            maps: &mut maps,
            files: &mut files,
        };
        pump_records(&buffer, head, 0, 1000, &mut effects);

        assert_eq!(files.path_of(&file_id()), Some("/usr/lib/libc.so.6"));
        let (id, offset) = maps.resolve(0x400010, 100).unwrap();
        assert_eq!(id, file_id());
        assert_eq!(offset, 0x2010);
    }
}
