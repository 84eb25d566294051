//! Logical clocks: the system clock and per-NIC hardware clocks.
//!
//! A clock is identified by a stable 8-byte hardware id derived from the
//! adapter's permanent MAC (EUI-64 expansion); the system clock uses the
//! all-zero id. Clocks are created during enumeration and on hotplug and
//! destroyed only at daemon exit.

pub mod hwlock;
pub mod registry;

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::time::TimeSpec;

pub use hwlock::{HardwareGuard, HardwareLock};
pub use registry::ClockRegistry;

// clock_adjtime mode bits.
const ADJ_FREQUENCY: libc::c_uint = 0x0002;
const ADJ_SETOFFSET: libc::c_uint = 0x0100;
const ADJ_NANO: libc::c_uint = 0x2000;

/// Stable 8-byte clock hardware identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwId(pub [u8; 8]);

impl HwId {
    /// The system clock's id.
    pub const SYSTEM: HwId = HwId([0; 8]);

    /// EUI-64 expansion of a permanent MAC address.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        HwId([
            mac[0], mac[1], mac[2], 0xff, 0xfe, mac[3], mac[4], mac[5],
        ])
    }

    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}

impl fmt::Display for HwId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// What kind of timekeeper this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    System,
    /// PHC with the adapter's private timestamping interface as well.
    PhcAndEfx,
    PhcOnly,
    EfxOnly,
}

impl fmt::Display for ClockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::PhcAndEfx => write!(f, "phc+efx"),
            Self::PhcOnly => write!(f, "phc"),
            Self::EfxOnly => write!(f, "efx"),
        }
    }
}

/// Discipline state of a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockClass {
    Locked,
    Holdover,
    #[default]
    Freerunning,
}

impl ClockClass {
    /// Ordering rank for reference selection; lower is better.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Locked => 0,
            Self::Holdover => 1,
            Self::Freerunning => 2,
        }
    }
}

impl fmt::Display for ClockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::Holdover => write!(f, "holdover"),
            Self::Freerunning => write!(f, "freerunning"),
        }
    }
}

/// Mutable clock attributes, guarded by the clock's own mutex; cross-clock
/// consistency additionally requires the hardware state lock.
#[derive(Debug, Default)]
struct ClockState {
    class: ClockClass,
    /// ns; `None` is unbounded.
    accuracy_ns: Option<f64>,
    stratum: u8,
    time_traceable: bool,
    freq_traceable: bool,
    /// Currently applied frequency adjustment.
    freq_adj_ppb: f64,
    steps: u64,
}

/// A logical timekeeper.
pub struct Clock {
    hwid: HwId,
    kind: ClockKind,
    long_name: String,
    /// Interfaces this clock serves. Grows on hotplug when another port of
    /// the same adapter appears.
    ifindexes: Mutex<Vec<i32>>,
    phc_index: i32,
    /// Open /dev/ptpN descriptor, -1 for the system clock.
    phc_fd: RawFd,
    clockid: libc::clockid_t,
    state: Mutex<ClockState>,
}

fn phc_clockid(fd: RawFd) -> libc::clockid_t {
    ((!(fd as libc::clockid_t)) << 3) | 3
}

impl Clock {
    /// The system (CLOCK_REALTIME) clock.
    pub fn system() -> Self {
        Self {
            hwid: HwId::SYSTEM,
            kind: ClockKind::System,
            long_name: "system".to_string(),
            ifindexes: Mutex::new(Vec::new()),
            phc_index: -1,
            phc_fd: -1,
            clockid: libc::CLOCK_REALTIME,
            state: Mutex::new(ClockState {
                stratum: 15,
                ..Default::default()
            }),
        }
    }

    /// A deviceless stand-in clock reading the monotonic clock, for tests
    /// that need hardware entries in the registry without /dev/ptp devices.
    #[cfg(test)]
    pub(crate) fn fake(hwid: HwId, name: &str) -> Self {
        Self {
            hwid,
            kind: ClockKind::PhcOnly,
            long_name: name.to_string(),
            ifindexes: Mutex::new(Vec::new()),
            phc_index: -1,
            phc_fd: -1,
            clockid: libc::CLOCK_MONOTONIC,
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Open a PHC device clock.
    pub fn open_phc(
        hwid: HwId,
        kind: ClockKind,
        phc_index: i32,
        ifname: &str,
        ifindex: i32,
    ) -> Result<Self> {
        let path = format!("/dev/ptp{phc_index}\0");
        let fd = unsafe {
            libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDWR | libc::O_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        Ok(Self {
            hwid,
            kind,
            long_name: format!("phc{phc_index}({ifname})"),
            ifindexes: Mutex::new(vec![ifindex]),
            phc_index,
            phc_fd: fd,
            clockid: phc_clockid(fd),
            state: Mutex::new(ClockState::default()),
        })
    }

    pub fn hwid(&self) -> HwId {
        self.hwid
    }

    pub fn kind(&self) -> ClockKind {
        self.kind
    }

    pub fn long_name(&self) -> &str {
        &self.long_name
    }

    pub fn phc_index(&self) -> i32 {
        self.phc_index
    }

    pub fn ifindexes(&self) -> Vec<i32> {
        self.ifindexes.lock().unwrap().clone()
    }

    pub(crate) fn add_ifindex(&self, ifindex: i32) {
        let mut v = self.ifindexes.lock().unwrap();
        if !v.contains(&ifindex) {
            v.push(ifindex);
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == ClockKind::System
    }

    pub fn class(&self) -> ClockClass {
        self.state.lock().unwrap().class
    }

    pub fn set_class(&self, class: ClockClass) {
        self.state.lock().unwrap().class = class;
    }

    pub fn accuracy_ns(&self) -> Option<f64> {
        self.state.lock().unwrap().accuracy_ns
    }

    pub fn set_accuracy_ns(&self, accuracy: Option<f64>) {
        self.state.lock().unwrap().accuracy_ns = accuracy;
    }

    pub fn stratum(&self) -> u8 {
        self.state.lock().unwrap().stratum
    }

    pub fn set_stratum(&self, stratum: u8) {
        self.state.lock().unwrap().stratum = stratum;
    }

    pub fn traceability(&self) -> (bool, bool) {
        let s = self.state.lock().unwrap();
        (s.time_traceable, s.freq_traceable)
    }

    pub fn set_traceability(&self, time: bool, freq: bool) {
        let mut s = self.state.lock().unwrap();
        s.time_traceable = time;
        s.freq_traceable = freq;
    }

    pub fn freq_adj_ppb(&self) -> f64 {
        self.state.lock().unwrap().freq_adj_ppb
    }

    pub fn step_count(&self) -> u64 {
        self.state.lock().unwrap().steps
    }

    /// Read the clock.
    pub fn read_time(&self) -> Result<TimeSpec> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(self.clockid, &mut ts) } < 0 {
            return Err(Error::last_os());
        }
        Ok(TimeSpec::from_timespec(ts))
    }

    /// Set the clock to an absolute time.
    pub fn set_time(&self, time: TimeSpec) -> Result<()> {
        let ts = time.to_timespec();
        if unsafe { libc::clock_settime(self.clockid, &ts) } < 0 {
            return Err(Error::last_os());
        }
        let mut s = self.state.lock().unwrap();
        s.steps += 1;
        Ok(())
    }

    /// Step the clock by a signed offset, atomically in the kernel.
    pub fn adjust_time(&self, offset: TimeSpec) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = ADJ_SETOFFSET | ADJ_NANO;
        tx.time.tv_sec = offset.sec as libc::time_t;
        tx.time.tv_usec = offset.nsec as libc::suseconds_t;
        if unsafe { libc::clock_adjtime(self.clockid, &mut tx) } < 0 {
            return Err(Error::last_os());
        }
        let mut s = self.state.lock().unwrap();
        s.steps += 1;
        log::info!(
            "clock {}: stepped by {offset} (step #{})",
            self.long_name,
            s.steps
        );
        Ok(())
    }

    /// Apply a frequency adjustment in parts per billion.
    pub fn adjust_frequency(&self, ppb: f64) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        // timex frequency is in 2^-16 ppm.
        tx.freq = ((ppb / 1000.0) * 65536.0) as libc::c_long;
        if unsafe { libc::clock_adjtime(self.clockid, &mut tx) } < 0 {
            return Err(Error::last_os());
        }
        self.state.lock().unwrap().freq_adj_ppb = ppb;
        Ok(())
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        if self.phc_fd >= 0 {
            unsafe { libc::close(self.phc_fd) };
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("hwid", &self.hwid.to_string())
            .field("kind", &self.kind)
            .field("long_name", &self.long_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hwid_eui64_expansion() {
        let id = HwId::from_mac([0x00, 0x0f, 0x53, 0x12, 0x34, 0x56]);
        assert_eq!(id.0, [0x00, 0x0f, 0x53, 0xff, 0xfe, 0x12, 0x34, 0x56]);
        assert_eq!(id.to_string(), "00:0f:53:ff:fe:12:34:56");
        assert!(!id.is_system());
        assert!(HwId::SYSTEM.is_system());
    }

    #[test]
    fn test_system_clock_reads() {
        let clock = Clock::system();
        let a = clock.read_time().unwrap();
        let b = clock.read_time().unwrap();
        assert!(b >= a);
        assert_eq!(clock.kind(), ClockKind::System);
        assert_eq!(clock.long_name(), "system");
    }

    #[test]
    fn test_class_rank_ordering() {
        assert!(ClockClass::Locked.rank() < ClockClass::Holdover.rank());
        assert!(ClockClass::Holdover.rank() < ClockClass::Freerunning.rank());
    }

    #[test]
    fn test_phc_clockid_derivation() {
        // FD_TO_CLOCKID: ((~fd) << 3) | 3
        assert_eq!(phc_clockid(3), ((!3) << 3) | 3);
    }
}
