//! Per-CPU profiling session: the two perf events (hardware SPE sampler
//! plus the SW_DUMMY companion that contributes MMAP2/EXIT/SWITCH records),
//! the shared record ring, the separate aux ring, and the clock conversion
//! parameters read from the ring metadata page.
//!
//! The kernel writes `data_head`/`aux_head`; we write the tails. Reads of a
//! head are followed by an acquire fence before any data byte is touched,
//! and tail publication is fenced symmetrically.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::{self, c_void};
use log::debug;

use crate::error::Error;
use crate::sys::*;
use crate::sys_info::{BufferSizes, SystemConfig};

/// Cycle-counter to perf-clock conversion, captured once per session from
/// the ring metadata page.
#[derive(Debug, Clone, Copy, Default)]
pub struct TscConversion {
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_zero: u64,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub cap_user_time_zero: bool,
    pub cap_user_time_short: bool,
}

impl TscConversion {
    unsafe fn from_meta(meta: *const PerfEventMmapPage) -> TscConversion {
        let capabilities = ptr::read_volatile(&(*meta).capabilities);
        TscConversion {
            time_shift: ptr::read_volatile(&(*meta).time_shift),
            time_mult: ptr::read_volatile(&(*meta).time_mult),
            time_zero: ptr::read_volatile(&(*meta).time_zero),
            time_cycles: ptr::read_volatile(&(*meta).time_cycles),
            time_mask: ptr::read_volatile(&(*meta).time_mask),
            cap_user_time_zero: capabilities & PERF_CAP_USER_TIME_ZERO != 0,
            cap_user_time_short: capabilities & PERF_CAP_USER_TIME_SHORT != 0,
        }
    }

    /// Converts an SPE cycle timestamp to the perf clock. The transform is
    /// monotone, so record-stream ordering carries over to sample times.
    /// Referenced from linux/tools/perf/util/tsc.c and perf_event_open(2).
    pub fn to_perf_time(&self, cyc: u64) -> u64 {
        let mut cyc = cyc;
        if self.cap_user_time_short {
            cyc = self
                .time_cycles
                .wrapping_add(cyc.wrapping_sub(self.time_cycles) & self.time_mask);
        }

        let quot = cyc >> self.time_shift;
        let rem = cyc & ((1u64 << self.time_shift) - 1);
        self.time_zero
            .wrapping_add(quot.wrapping_mul(self.time_mult as u64))
            .wrapping_add((rem.wrapping_mul(self.time_mult as u64)) >> self.time_shift)
    }
}

unsafe fn read_record_head(meta: *const PerfEventMmapPage) -> u64 {
    let head = ptr::read_volatile(&(*meta).data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn read_aux_head(meta: *const PerfEventMmapPage) -> u64 {
    let head = ptr::read_volatile(&(*meta).aux_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn write_record_tail(meta: *mut PerfEventMmapPage, value: u64) {
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut (*meta).data_tail, value);
}

unsafe fn write_aux_tail(meta: *mut PerfEventMmapPage, value: u64) {
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut (*meta).aux_tail, value);
}

/// One CPU's profiling state: fds, ring mappings, consumer cursors and
/// clock parameters, plus the PID the kernel last scheduled onto the CPU.
pub struct CpuSession {
    pub cpu: u32,
    hardware_fd: RawFd,
    software_fd: RawFd,
    buffer: *mut u8,
    buffer_len: usize,
    data_offset: u64,
    data_size: u64,
    aux_buffer: *mut u8,
    aux_size: u64,
    pub tsc: TscConversion,

    /// Most recent SWITCH_CPU_WIDE target; -1 until the first switch.
    pub active_pid: i32,
    pub record_tail: u64,
    pub aux_tail: u64,
    pub last_record_ts: u64,
    pub last_aux_ts: u64,
}

impl CpuSession {
    pub fn open(
        cpu: u32,
        sys: &SystemConfig,
        sizes: &BufferSizes,
        sample_period: u64,
    ) -> Result<CpuSession, Error> {
        let hardware_fd = open_hardware_event(cpu, sys, sample_period)?;
        let software_fd = match open_software_event(cpu, sample_period) {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(hardware_fd) };
                return Err(err);
            }
        };

        let close_fds = || unsafe {
            libc::close(hardware_fd);
            libc::close(software_fd);
        };

        let buffer_len = sizes.record_buf as usize;
        let buffer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                buffer_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                hardware_fd,
                0,
            )
        };
        if buffer == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            close_fds();
            return Err(Error::RingMmap { cpu, source: err });
        }
        let buffer = buffer as *mut u8;
        let meta = buffer as *mut PerfEventMmapPage;

        // The aux region is described in the metadata page and then mapped
        // separately beyond the record pages.
        unsafe {
            ptr::write_volatile(&mut (*meta).aux_offset, sizes.aux_offset);
            ptr::write_volatile(&mut (*meta).aux_size, sizes.aux_buf);
        }

        let aux_buffer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                sizes.aux_buf as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                hardware_fd,
                sizes.aux_offset as i64,
            )
        };
        if aux_buffer == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(buffer as *mut c_void, buffer_len) };
            close_fds();
            return Err(Error::RingMmap { cpu, source: err });
        }
        let aux_buffer = aux_buffer as *mut u8;

        let setup = (|| -> io::Result<()> {
            if unsafe { libc::fcntl(hardware_fd, libc::F_SETFL, libc::O_RDONLY | libc::O_NONBLOCK) }
                == -1
            {
                return Err(io::Error::last_os_error());
            }
            // Redirect the software event's records into the hardware
            // event's ring so one merged, time-ordered stream per CPU
            // carries both.
            if unsafe { libc::ioctl(software_fd, PERF_EVENT_IOC_SET_OUTPUT, hardware_fd) } == -1 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::fcntl(software_fd, libc::F_SETFL, libc::O_RDONLY | libc::O_NONBLOCK) }
                == -1
            {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })();
        if let Err(err) = setup {
            unsafe {
                libc::munmap(aux_buffer as *mut c_void, sizes.aux_buf as usize);
                libc::munmap(buffer as *mut c_void, buffer_len);
            }
            close_fds();
            return Err(Error::EventSetup { cpu, source: err });
        }

        let (data_offset, data_size, tsc) = unsafe {
            let data_offset = ptr::read_volatile(&(*meta).data_offset);
            let data_size = ptr::read_volatile(&(*meta).data_size);
            let data_offset = if data_offset != 0 {
                data_offset
            } else {
                sys.page_size
            };
            let data_size = if data_size != 0 {
                data_size
            } else {
                sizes.record_buf - sys.page_size
            };
            (data_offset, data_size, TscConversion::from_meta(meta))
        };

        debug!(
            "cpu {cpu}: record ring {data_size} bytes, aux ring {} bytes",
            sizes.aux_buf
        );

        Ok(CpuSession {
            cpu,
            hardware_fd,
            software_fd,
            buffer,
            buffer_len,
            data_offset,
            data_size,
            aux_buffer,
            aux_size: sizes.aux_buf,
            tsc,
            active_pid: -1,
            record_tail: 0,
            aux_tail: 0,
            last_record_ts: 0,
            last_aux_ts: 0,
        })
    }

    /// Starts both events. The hardware event leads the pair; the software
    /// companion only produces records while it is scheduled alongside.
    pub fn enable(&self) -> io::Result<()> {
        if unsafe { libc::ioctl(self.hardware_fd, PERF_EVENT_IOC_ENABLE, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ioctl(self.software_fd, PERF_EVENT_IOC_ENABLE, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn meta(&self) -> *mut PerfEventMmapPage {
        self.buffer as *mut PerfEventMmapPage
    }

    pub fn record_head(&self) -> u64 {
        unsafe { read_record_head(self.meta()) }
    }

    pub fn aux_head(&self) -> u64 {
        unsafe { read_aux_head(self.meta()) }
    }

    pub fn record_data(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                self.buffer.add(self.data_offset as usize),
                self.data_size as usize,
            )
        }
    }

    pub fn aux_data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.aux_buffer, self.aux_size as usize) }
    }

    pub fn publish_record_tail(&mut self, tail: u64) {
        self.record_tail = tail;
        unsafe { write_record_tail(self.meta(), tail) };
    }

    pub fn publish_aux_tail(&mut self, tail: u64) {
        self.aux_tail = tail;
        unsafe { write_aux_tail(self.meta(), tail) };
    }
}

impl Drop for CpuSession {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.aux_buffer as *mut c_void, self.aux_size as usize);
            libc::munmap(self.buffer as *mut c_void, self.buffer_len);
            libc::close(self.software_fd);
            libc::close(self.hardware_fd);
        }
    }
}

fn open_hardware_event(cpu: u32, sys: &SystemConfig, sample_period: u64) -> Result<RawFd, Error> {
    let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
    attr.kind = sys.perf_event_type;
    attr.size = mem::size_of::<PerfEventAttr>() as u32;
    attr.config = PERF_ARM_SPE_RAW_CONFIG;
    attr.sample_period_or_freq = sample_period;
    attr.sample_type = PERF_SAMPLE_IP
        | PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_DATA_SRC
        | PERF_SAMPLE_IDENTIFIER
        | PERF_SAMPLE_BRANCH_STACK;
    attr.read_format = PERF_FORMAT_ID | PERF_FORMAT_LOST;
    attr.flags = PERF_ATTR_FLAG_DISABLED
        | PERF_ATTR_FLAG_INHERIT
        | PERF_ATTR_FLAG_SAMPLE_ID_ALL
        | PERF_ATTR_FLAG_EXCLUDE_GUEST
        | PERF_ATTR_FLAG_CONTEX_SWITCH;
    attr.branch_sample_type = PERF_SAMPLE_BRANCH_ANY;
    attr.aux_watermark = AUX_WATERMARK;

    // pid = -1: every process on this particular CPU.
    let fd = sys_perf_event_open(&attr, -1, cpu as i32, -1, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(Error::PerfEventOpen {
            cpu,
            source: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

fn open_software_event(cpu: u32, sample_period: u64) -> Result<RawFd, Error> {
    let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.size = mem::size_of::<PerfEventAttr>() as u32;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.sample_period_or_freq = sample_period;
    attr.sample_type = PERF_SAMPLE_IP
        | PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_IDENTIFIER;
    attr.read_format = PERF_FORMAT_ID | PERF_FORMAT_LOST;
    attr.flags = PERF_ATTR_FLAG_DISABLED
        | PERF_ATTR_FLAG_EXCLUDE_KERNEL
        | PERF_ATTR_FLAG_EXCLUDE_HV
        | PERF_ATTR_FLAG_MMAP
        | PERF_ATTR_FLAG_MMAP2
        | PERF_ATTR_FLAG_SAMPLE_ID_ALL
        | PERF_ATTR_FLAG_EXCLUDE_GUEST
        | PERF_ATTR_FLAG_CONTEX_SWITCH
        | PERF_ATTR_FLAG_WATERMARK;

    let fd = sys_perf_event_open(&attr, -1, cpu as i32, -1, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(Error::PerfEventOpen {
            cpu,
            source: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}
