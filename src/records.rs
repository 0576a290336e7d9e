//! Parsing of the perf records this profiler subscribes to.
//!
//! The software companion event redirects its output into the hardware
//! event's record ring, so one merged stream per CPU carries the MMAP2,
//! EXIT and SWITCH_CPU_WIDE records that keep the mapping directory and
//! the active-PID slot synchronized with the kernel.

use byteorder::ByteOrder;

use crate::file_registry::FileId;
use crate::raw_data::RawData;
use crate::sys::*;

/// Size of the `sample_id` trailer under this tool's sample_type:
/// pid/tid, time, cpu/res, identifier.
pub const SAMPLE_ID_SIZE: usize = 32;

/// Offset of the `time` field from the end of a record that carries a
/// `sample_id` trailer (identifier and cpu/res follow it).
const TIME_OFFSET_FROM_END: usize = 24;

#[derive(Debug, Clone)]
pub enum Record<'a> {
    Mmap2(Mmap2Record<'a>),
    Exit(ExitRecord),
    SwitchCpuWide(SwitchCpuWideRecord),
    Other,
}

#[derive(Debug, Clone)]
pub struct Mmap2Record<'a> {
    pub pid: i32,
    pub tid: i32,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub file_id: FileId,
    pub protection: u32,
    pub flags: u32,
    pub path: RawData<'a>,
}

impl<'a> Mmap2Record<'a> {
    pub fn parse<T: ByteOrder>(data: RawData<'a>) -> Result<Self, std::io::Error> {
        let mut cur = data;

        let pid = cur.read_i32::<T>()?;
        let tid = cur.read_i32::<T>()?;
        let address = cur.read_u64::<T>()?;
        let length = cur.read_u64::<T>()?;
        let page_offset = cur.read_u64::<T>()?;
        let major = cur.read_u32::<T>()?;
        let minor = cur.read_u32::<T>()?;
        let inode = cur.read_u64::<T>()?;
        let generation = cur.read_u64::<T>()?;
        let protection = cur.read_u32::<T>()?;
        let flags = cur.read_u32::<T>()?;
        let path = cur
            .read_string()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))?;

        Ok(Mmap2Record {
            pid,
            tid,
            address,
            length,
            page_offset,
            file_id: FileId {
                major,
                minor,
                inode,
                generation,
            },
            protection,
            flags,
            path,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub pid: i32,
    pub ppid: i32,
    pub tid: i32,
    pub ptid: i32,
    pub time: u64,
}

impl ExitRecord {
    pub fn parse<T: ByteOrder>(data: RawData) -> Result<Self, std::io::Error> {
        let mut cur = data;

        let pid = cur.read_i32::<T>()?;
        let ppid = cur.read_i32::<T>()?;
        let tid = cur.read_i32::<T>()?;
        let ptid = cur.read_i32::<T>()?;
        let time = cur.read_u64::<T>()?;

        Ok(ExitRecord {
            pid,
            ppid,
            tid,
            ptid,
            time,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchCpuWideRecord {
    pub next_prev_pid: i32,
    pub next_prev_tid: i32,
}

impl SwitchCpuWideRecord {
    pub fn parse<T: ByteOrder>(data: RawData) -> Result<Self, std::io::Error> {
        let mut cur = data;

        let next_prev_pid = cur.read_i32::<T>()?;
        let next_prev_tid = cur.read_i32::<T>()?;

        Ok(SwitchCpuWideRecord {
            next_prev_pid,
            next_prev_tid,
        })
    }
}

/// Demultiplexes a record payload by its header type. Types outside the
/// subscribed set come back as `Other`.
pub fn parse_record<T: ByteOrder>(
    kind: u32,
    data: RawData,
) -> Result<Record<'_>, std::io::Error> {
    let record = match kind {
        PERF_RECORD_MMAP2 => Record::Mmap2(Mmap2Record::parse::<T>(data)?),
        PERF_RECORD_EXIT => Record::Exit(ExitRecord::parse::<T>(data)?),
        PERF_RECORD_SWITCH_CPU_WIDE => {
            Record::SwitchCpuWide(SwitchCpuWideRecord::parse::<T>(data)?)
        }
        _ => Record::Other,
    };
    Ok(record)
}

/// Extracts the perf-clock timestamp from a record's `sample_id` trailer.
///
/// Only the record kinds whose ordering matters against the SPE stream are
/// inspected; everything else reports 0 and is processed unconditionally.
/// For MMAP2 the trailer floats behind the variable-length path, so the
/// time is located from the end of the record.
pub fn record_timestamp<T: ByteOrder>(kind: u32, data: RawData) -> u64 {
    match kind {
        PERF_RECORD_MMAP2 | PERF_RECORD_EXIT | PERF_RECORD_SWITCH_CPU_WIDE | PERF_RECORD_AUX => {
            let len = data.len();
            if len < SAMPLE_ID_SIZE {
                return 0;
            }
            let mut cur = data;
            if cur.skip(len - TIME_OFFSET_FROM_END).is_err() {
                return 0;
            }
            cur.read_u64::<T>().unwrap_or(0)
        }
        _ => 0,
    }
}
