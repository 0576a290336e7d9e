#![allow(unused)]

use std::fmt;

use libc::{c_int, c_ulong, pid_t, syscall, SYS_perf_event_open};

#[cfg(target_endian = "big")]
macro_rules! flag {
    ($nth:expr) => {
        (1 << 63) >> $nth
    };
}

#[cfg(target_endian = "little")]
macro_rules! flag {
    ($nth:expr) => {
        1 << $nth
    };
}

pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;

/// Raw SPE config: load and branch collection enabled.
/// See the Arm SPE Performance Analysis Methodology white paper, section 2.
pub const PERF_ARM_SPE_RAW_CONFIG: u64 = 0x10001;

/// Aux watermark for PERF_RECORD_AUX generation.
pub const AUX_WATERMARK: u32 = 64;

pub const PERF_ATTR_FLAG_DISABLED: u64 = flag!(0);
pub const PERF_ATTR_FLAG_INHERIT: u64 = flag!(1);
pub const PERF_ATTR_FLAG_PINNED: u64 = flag!(2);
pub const PERF_ATTR_FLAG_EXCLUSIVE: u64 = flag!(3);
pub const PERF_ATTR_FLAG_EXCLUDE_USER: u64 = flag!(4);
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = flag!(5);
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = flag!(6);
pub const PERF_ATTR_FLAG_EXCLUDE_IDLE: u64 = flag!(7);
pub const PERF_ATTR_FLAG_MMAP: u64 = flag!(8);
pub const PERF_ATTR_FLAG_COMM: u64 = flag!(9);
pub const PERF_ATTR_FLAG_FREQ: u64 = flag!(10);
pub const PERF_ATTR_FLAG_INHERIT_STAT: u64 = flag!(11);
pub const PERF_ATTR_FLAG_ENABLE_ON_EXEC: u64 = flag!(12);
pub const PERF_ATTR_FLAG_TASK: u64 = flag!(13);
pub const PERF_ATTR_FLAG_WATERMARK: u64 = flag!(14);
pub const PERF_ATTR_FLAG_MMAP_DATA: u64 = flag!(17);
pub const PERF_ATTR_FLAG_SAMPLE_ID_ALL: u64 = flag!(18);
pub const PERF_ATTR_FLAG_EXCLUDE_HOST: u64 = flag!(19);
pub const PERF_ATTR_FLAG_EXCLUDE_GUEST: u64 = flag!(20);
pub const PERF_ATTR_FLAG_MMAP2: u64 = flag!(23);
pub const PERF_ATTR_FLAG_COMM_EXEC: u64 = flag!(24);
pub const PERF_ATTR_FLAG_USE_CLOCKID: u64 = flag!(25);
pub const PERF_ATTR_FLAG_CONTEX_SWITCH: u64 = flag!(26);

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_AUX: u32 = 11;
pub const PERF_RECORD_ITRACE_START: u32 = 12;
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;
pub const PERF_RECORD_NAMESPACES: u32 = 16;
pub const PERF_RECORD_KSYMBOL: u32 = 17;
pub const PERF_RECORD_BPF_EVENT: u32 = 18;
pub const PERF_RECORD_CGROUP: u32 = 19;
pub const PERF_RECORD_TEXT_POKE: u32 = 20;

pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;
pub const PERF_RECORD_MISC_SWITCH_OUT_PREEMPT: u16 = 1 << 14;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_BRANCH_STACK: u64 = 1 << 11;
pub const PERF_SAMPLE_DATA_SRC: u64 = 1 << 15;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

pub const PERF_SAMPLE_BRANCH_ANY: u64 = 1 << 3;

pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_LOST: u64 = 1 << 4;

/// Bits of `PerfEventMmapPage::capabilities`.
pub const PERF_CAP_USER_TIME_ZERO: u64 = 1 << 4;
pub const PERF_CAP_USER_TIME_SHORT: u64 = 1 << 5;

mod ioctl {
    use libc::c_ulong;

    #[cfg(not(any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "powerpc",
        target_arch = "powerpc64"
    )))]
    mod arch {
        use libc::c_ulong;

        pub const IOC_SIZEBITS: c_ulong = 14;
        pub const IOC_DIRBITS: c_ulong = 2;
        pub const IOC_NONE: c_ulong = 0;
    }

    #[cfg(any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "powerpc",
        target_arch = "powerpc64"
    ))]
    mod arch {
        use libc::c_ulong;

        pub const IOC_SIZEBITS: c_ulong = 13;
        pub const IOC_DIRBITS: c_ulong = 3;
        pub const IOC_NONE: c_ulong = 1;
    }

    pub use self::arch::*;

    pub const IOC_NRSHIFT: c_ulong = 0;
    pub const IOC_NRBITS: c_ulong = 8;
    pub const IOC_TYPEBITS: c_ulong = 8;
    pub const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
    pub const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
    pub const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;
}

macro_rules! ioc {
    ($dir:expr, $kind:expr, $nr:expr, $size:expr) => {
        ($dir << ioctl::IOC_DIRSHIFT)
            | (($kind as c_ulong) << ioctl::IOC_TYPESHIFT)
            | ($nr << ioctl::IOC_NRSHIFT)
            | ($size << ioctl::IOC_SIZESHIFT)
    };
}

macro_rules! io {
    ($kind:expr, $nr:expr) => {
        ioc!(ioctl::IOC_NONE, $kind, $nr, 0)
    };
}

pub const PERF_EVENT_IOC_ENABLE: c_ulong = io!(b'$', 0);
pub const PERF_EVENT_IOC_DISABLE: c_ulong = io!(b'$', 1);
pub const PERF_EVENT_IOC_SET_OUTPUT: c_ulong = io!(b'$', 5);

/// `perf_event_attr`, V5 layout (through `aux_watermark`), 112 bytes.
#[repr(C)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config: u64,
    pub bp_len_or_config: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
}

/// First page of the record-ring mapping. The aux head/tail block at the
/// end controls the separately mapped aux region.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

impl fmt::Debug for PerfEventMmapPage {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        fmt.debug_map()
            .entry(&"version", &self.version)
            .entry(&"capabilities", &self.capabilities)
            .entry(&"time_shift", &self.time_shift)
            .entry(&"time_mult", &self.time_mult)
            .entry(&"time_offset", &self.time_offset)
            .entry(&"time_zero", &self.time_zero)
            .entry(&"time_cycles", &self.time_cycles)
            .entry(&"time_mask", &self.time_mask)
            .entry(&"data_head", &self.data_head)
            .entry(&"data_tail", &self.data_tail)
            .entry(&"data_offset", &self.data_offset)
            .entry(&"data_size", &self.data_size)
            .entry(&"aux_head", &self.aux_head)
            .entry(&"aux_tail", &self.aux_tail)
            .entry(&"aux_offset", &self.aux_offset)
            .entry(&"aux_size", &self.aux_size)
            .finish()
    }
}

pub fn sys_perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> c_int {
    unsafe {
        syscall(
            SYS_perf_event_open,
            attr as *const _,
            pid,
            cpu,
            group_fd,
            flags,
        ) as c_int
    }
}
