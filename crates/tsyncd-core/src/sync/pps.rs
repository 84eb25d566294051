//! PPS sync module: one-pulse-per-second discipline of a NIC hardware clock.
//!
//! Subscribes to the kernel PPS device associated with the configured
//! interface and measures the offset of each pulse from the top of the
//! second on the interface's hardware clock. Delivered accuracy is on the
//! order of tens of nanoseconds when the pulse train is healthy.

use std::io::Write;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::clocks::Clock;
use crate::config::{InstanceConfig, ModuleKind};
use crate::error::{Error, Result};
use crate::runtime::timer::{TimerId, TimerSpec};
use crate::runtime::ThreadContext;
use crate::sync::status::{
    Alarm, ControlFlags, GrandmasterInfo, SyncInstanceStatus, SyncState,
};
use crate::sync::{write_state_header, ModuleServices, SyncModule};
use crate::time::{ClockDomain, TimeSpec, NSEC_PER_SEC};

const TIMER_POLL: TimerId = TimerId(1);
const POLL_INTERVAL: TimeSpec = TimeSpec { sec: 1, nsec: 0 };

/// Pulses may go missing for this many polls before the alarm raises.
const MISSED_PULSE_LIMIT: u32 = 3;

/// Accuracy reported while the pulse train is healthy.
const PPS_ACCURACY_NS: f64 = 50.0;

// Kernel PPS ABI (linux/pps.h), declared locally.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsKinfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsFdata {
    info: PpsKinfo,
    timeout: PpsKtime,
}

const fn iowr(typ: u8, nr: u8, size: usize) -> libc::c_ulong {
    // _IOWR(type, nr, size): dir=3 in the top two bits.
    ((3u64 << 30) | ((size as u64) << 16) | ((typ as u64) << 8) | nr as u64) as libc::c_ulong
}

const PPS_FETCH: libc::c_ulong = iowr(b'p', 0xa4, std::mem::size_of::<PpsFdata>());

/// Locate the PPS device attached to `ifname`, via /sys/class/pps.
fn find_pps_device(ifname: &str) -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/pps").ok()?;
    for entry in entries.flatten() {
        let dev = entry.file_name().to_string_lossy().to_string();
        let name_path = entry.path().join("name");
        if let Ok(name) = std::fs::read_to_string(&name_path) {
            if name.trim() == ifname {
                return Some(format!("/dev/{dev}"));
            }
        }
    }
    None
}

pub struct PpsModule {
    cfg: InstanceConfig,
    services: ModuleServices,
    fd: RawFd,
    clock: Option<Arc<Clock>>,
    control: ControlFlags,
    alarms: Alarm,
    last_sequence: u32,
    missed_polls: u32,
    offset_ns: f64,
    last_measurement: Option<TimeSpec>,
    leap_pending: (bool, bool),
}

impl PpsModule {
    pub fn new(cfg: InstanceConfig, services: ModuleServices) -> Self {
        Self {
            cfg,
            services,
            fd: -1,
            clock: None,
            control: ControlFlags::TIMESTAMP_PROCESSING,
            alarms: Alarm::empty(),
            last_sequence: 0,
            missed_polls: 0,
            offset_ns: 0.0,
            last_measurement: None,
            leap_pending: (false, false),
        }
    }

    fn fetch(&self) -> Result<PpsKinfo> {
        let mut data = PpsFdata::default();
        // Zero timeout: report the current event counts without waiting.
        let rc = unsafe { libc::ioctl(self.fd, PPS_FETCH, &mut data) };
        if rc < 0 {
            return Err(Error::last_os());
        }
        Ok(data.info)
    }

    fn poll_pulse(&mut self) {
        if self.control.contains(ControlFlags::LEAP_SECOND_GUARD) {
            // Pulses around the leap edge are ambiguous; resume after.
            return;
        }
        let info = match self.fetch() {
            Ok(i) => i,
            Err(e) => {
                log::warn!("pps {}: fetch failed: {e}", self.cfg.name);
                self.note_missed();
                return;
            }
        };
        if info.assert_sequence == self.last_sequence {
            self.note_missed();
            return;
        }
        self.last_sequence = info.assert_sequence;
        self.missed_polls = 0;
        self.alarms.remove(Alarm::NO_PPS_SIGNAL);

        // Offset of the pulse from the nearest second boundary, folded into
        // [-0.5s, +0.5s).
        let mut offset = info.assert_tu.nsec as i64;
        if offset >= NSEC_PER_SEC / 2 {
            offset -= NSEC_PER_SEC;
        }
        self.offset_ns = offset as f64;
        self.last_measurement = Some(TimeSpec::now(ClockDomain::Monotonic));
        log::trace!(
            "pps {}: pulse seq {} offset {}ns",
            self.cfg.name,
            info.assert_sequence,
            offset
        );
    }

    fn note_missed(&mut self) {
        self.missed_polls += 1;
        if self.missed_polls >= MISSED_PULSE_LIMIT && !self.alarms.contains(Alarm::NO_PPS_SIGNAL)
        {
            log::warn!(
                "pps {}: no pulse for {} polls, raising alarm",
                self.cfg.name,
                self.missed_polls
            );
            self.alarms.insert(Alarm::NO_PPS_SIGNAL);
        }
    }

    fn grandmaster(&self) -> GrandmasterInfo {
        GrandmasterInfo {
            clock_id: self.clock.as_ref().map_or(crate::clocks::HwId::SYSTEM, |c| c.hwid()),
            clock_class: 6,
            time_source: 0x20, // GPS
            accuracy_ns: PPS_ACCURACY_NS,
            variance: 0x4e5d,
            steps_removed: 0,
            time_traceable: true,
            freq_traceable: true,
        }
    }
}

impl SyncModule for PpsModule {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        let ifname = self
            .cfg
            .interface
            .clone()
            .ok_or_else(|| Error::Config(format!("pps {}: no interface", self.cfg.name)))?;

        let device = find_pps_device(&ifname)
            .ok_or_else(|| Error::NoSuchDevice(format!("pps source for {ifname}")))?;
        let path = format!("{device}\0");
        let fd = unsafe {
            libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDWR | libc::O_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        self.fd = fd;
        log::info!("pps {}: using {device} for {ifname}", self.cfg.name);

        let latest = self.services.tables.latest_version();
        if let Some(table) = self.services.tables.get(latest) {
            if let Some(link) = table.by_name(&ifname) {
                self.clock = self.services.registry.find_by_ifindex(link.ifindex);
            }
        }

        ctx.create_timer(TIMER_POLL, ClockDomain::Monotonic)?;
        ctx.start_timer(TIMER_POLL, TimerSpec::periodic(POLL_INTERVAL))?;
        Ok(())
    }

    fn on_shutdown(&mut self, _ctx: &mut ThreadContext) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }

    fn control(&mut self, mask: ControlFlags, flags: ControlFlags) {
        self.control = (self.control - mask) | (flags & mask);
    }

    fn status(&self) -> SyncInstanceStatus {
        let mut s = SyncInstanceStatus::new(&self.cfg.name, ModuleKind::Pps, self.cfg.priority);
        s.state = if self.alarms.contains(Alarm::NO_PPS_SIGNAL) {
            SyncState::Faulty
        } else if self.last_measurement.is_some() {
            SyncState::Slave
        } else {
            SyncState::Listening
        };
        s.alarms = self.alarms;
        s.clock = self.clock.clone();
        s.offset_from_master_ns = self.offset_ns;
        s.last_measurement = self.last_measurement;
        s.grandmaster = self.grandmaster();
        s.local_accuracy_ns = PPS_ACCURACY_NS;
        s.control = self.control;
        s
    }

    fn step_clock(&mut self, offset: TimeSpec) -> Result<()> {
        let Some(clock) = &self.clock else {
            return Ok(());
        };
        self.services.registry.adjust_time(clock, offset)
    }

    fn update_grandmaster(&mut self, _info: &GrandmasterInfo) {}

    fn update_leap(&mut self, leap59: bool, leap61: bool) {
        self.leap_pending = (leap59, leap61);
    }

    fn save_state(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_state_header(w, &self.status())?;
        writeln!(w, "module: pps")?;
        writeln!(w, "pulse-sequence: {}", self.last_sequence)?;
        writeln!(
            w,
            "leap-pending: {}",
            match self.leap_pending {
                (true, _) => "59",
                (_, true) => "61",
                _ => "none",
            }
        )
    }

    fn write_topology(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            w,
            "pps({}) -> {}",
            self.cfg.interface.as_deref().unwrap_or("?"),
            self.clock
                .as_ref()
                .map_or_else(|| "(no clock)".to_string(), |c| c.long_name().to_string())
        )
    }

    fn on_timer(&mut self, _ctx: &mut ThreadContext, id: TimerId, _expiries: u64) {
        if id == TIMER_POLL {
            self.poll_pulse();
        }
    }

    fn wants_link_tables(&self) -> bool {
        true
    }

    fn on_link_table(&mut self, _ctx: &mut ThreadContext, table: &crate::link::LinkTable) {
        let Some(ifname) = self.cfg.interface.as_deref() else {
            return;
        };
        match table.by_name(ifname) {
            Some(link) => {
                self.alarms.remove(Alarm::INTERFACE_GONE);
                if self.clock.is_none() {
                    self.clock = self.services.registry.find_by_ifindex(link.ifindex);
                }
            }
            None => {
                self.alarms.insert(Alarm::INTERFACE_GONE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::{ClockRegistry, HardwareLock};
    use crate::link::LinkTableSet;

    fn module() -> PpsModule {
        PpsModule::new(
            InstanceConfig {
                name: "pps0".into(),
                module: ModuleKind::Pps,
                interface: Some("eth0".into()),
                priority: 64,
                ptp: Default::default(),
                clock: None,
            },
            ModuleServices {
                registry: Arc::new(ClockRegistry::new(Arc::new(HardwareLock::new()))),
                tables: Arc::new(LinkTableSet::new()),
                state_dir: std::env::temp_dir(),
            },
        )
    }

    #[test]
    fn test_missed_pulses_raise_alarm_after_limit() {
        let mut m = module();
        m.note_missed();
        m.note_missed();
        assert!(!m.alarms.contains(Alarm::NO_PPS_SIGNAL));
        m.note_missed();
        assert!(m.alarms.contains(Alarm::NO_PPS_SIGNAL));
        assert_eq!(m.status().state, SyncState::Faulty);
    }

    #[test]
    fn test_listening_until_first_pulse() {
        let m = module();
        assert_eq!(m.status().state, SyncState::Listening);
    }

    #[test]
    fn test_grandmaster_is_gps_grade() {
        let m = module();
        let gm = m.grandmaster();
        assert_eq!(gm.clock_class, 6);
        assert_eq!(gm.time_source, 0x20);
        assert!(gm.time_traceable);
    }

    #[test]
    fn test_pps_fetch_ioctl_encoding() {
        // dir=_IOWR, type 'p', nr 0xa4, struct size in bits 16..30.
        let code = PPS_FETCH;
        assert_eq!(code >> 30, 3);
        assert_eq!((code >> 8) & 0xff, b'p' as libc::c_ulong);
        assert_eq!(code & 0xff, 0xa4);
        assert_eq!(
            (code >> 16) & 0x3fff,
            std::mem::size_of::<PpsFdata>() as libc::c_ulong
        );
    }
}
