//! NTP helper sync module.
//!
//! Talks to a local NTP-like daemon over a unix datagram socket to obtain
//! its current offset, reference source and stratum, and — where the helper
//! grants it — asks the helper to apply steps on the daemon's behalf. The
//! protocol is a line-oriented key=value exchange; the helper binary itself
//! is an external collaborator.

use std::io::Write;
use std::os::unix::io::RawFd;

use crate::config::{InstanceConfig, ModuleKind};
use crate::error::{Error, Result};
use crate::runtime::timer::{TimerId, TimerSpec};
use crate::runtime::{Readiness, ThreadContext};
use crate::sync::status::{
    Alarm, ControlFlags, GrandmasterInfo, SyncInstanceStatus, SyncState,
};
use crate::sync::{write_state_header, ModuleServices, SyncModule};
use crate::time::{ClockDomain, TimeSpec};

/// Where the helper daemon listens.
pub const HELPER_SOCKET_PATH: &str = "/run/tsyncd-ntp-helper.sock";

const TIMER_POLL: TimerId = TimerId(1);
const POLL_INTERVAL: TimeSpec = TimeSpec { sec: 4, nsec: 0 };

/// Unanswered polls before the helper is declared unreachable.
const MISSED_REPLY_LIMIT: u32 = 3;

/// The last parsed helper report.
#[derive(Debug, Clone, Default)]
struct HelperReport {
    offset_s: f64,
    stratum: u8,
    source: String,
    synchronized: bool,
}

fn parse_report(text: &str) -> HelperReport {
    let mut r = HelperReport::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "offset" => r.offset_s = value.trim().parse().unwrap_or(0.0),
            "stratum" => r.stratum = value.trim().parse().unwrap_or(16),
            "source" => r.source = value.trim().to_string(),
            "synchronized" => r.synchronized = value.trim() == "1",
            _ => {}
        }
    }
    r
}

pub struct NtpModule {
    cfg: InstanceConfig,
    services: ModuleServices,
    fd: RawFd,
    control: ControlFlags,
    alarms: Alarm,
    report: Option<HelperReport>,
    last_measurement: Option<TimeSpec>,
    outstanding_polls: u32,
}

impl NtpModule {
    pub fn new(cfg: InstanceConfig, services: ModuleServices) -> Self {
        Self {
            cfg,
            services,
            fd: -1,
            control: ControlFlags::TIMESTAMP_PROCESSING,
            alarms: Alarm::empty(),
            report: None,
            last_measurement: None,
            outstanding_polls: 0,
        }
    }

    fn send_line(&self, line: &str) -> Result<()> {
        let n = unsafe {
            libc::send(
                self.fd,
                line.as_ptr() as *const libc::c_void,
                line.len(),
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Err(Error::WouldBlock);
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    fn poll_helper(&mut self) {
        self.outstanding_polls += 1;
        if self.outstanding_polls > MISSED_REPLY_LIMIT
            && !self.alarms.contains(Alarm::HELPER_UNREACHABLE)
        {
            log::warn!(
                "ntp {}: helper silent for {} polls",
                self.cfg.name,
                self.outstanding_polls - 1
            );
            self.alarms.insert(Alarm::HELPER_UNREACHABLE);
        }
        if let Err(e) = self.send_line("GETSTATUS\n") {
            log::debug!("ntp {}: poll send failed: {e}", self.cfg.name);
        }
    }

    fn read_replies(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n <= 0 {
                break;
            }
            let text = String::from_utf8_lossy(&buf[..n as usize]).to_string();
            let report = parse_report(&text);
            log::trace!(
                "ntp {}: offset={}s stratum={} source={} sync={}",
                self.cfg.name,
                report.offset_s,
                report.stratum,
                report.source,
                report.synchronized
            );
            self.report = Some(report);
            self.last_measurement = Some(TimeSpec::now(ClockDomain::Monotonic));
            self.outstanding_polls = 0;
            self.alarms.remove(Alarm::HELPER_UNREACHABLE);
        }
    }

    fn grandmaster(&self) -> GrandmasterInfo {
        let Some(report) = &self.report else {
            return GrandmasterInfo::default();
        };
        GrandmasterInfo {
            clock_id: crate::clocks::HwId::SYSTEM,
            // NTP strata map into the holdover-ish class band.
            clock_class: 80u8.saturating_add(report.stratum),
            time_source: 0x50, // NTP
            accuracy_ns: (report.stratum.max(1) as f64) * 1.0e6,
            variance: 0xffff,
            steps_removed: report.stratum as u16,
            time_traceable: report.synchronized,
            freq_traceable: false,
        }
    }
}

impl SyncModule for NtpModule {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        let fd = unsafe {
            libc::socket(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        // Autobind an abstract local address so the helper can answer.
        let mut local: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        local.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &local as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = Error::last_os();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let mut remote: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        remote.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, b) in HELPER_SOCKET_PATH.bytes().enumerate() {
            remote.sun_path[i] = b as libc::c_char;
        }
        let rc = unsafe {
            libc::connect(
                fd,
                &remote as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            // The helper may start later; keep polling and report the alarm.
            log::warn!(
                "ntp {}: helper not reachable at {HELPER_SOCKET_PATH} yet",
                self.cfg.name
            );
        }
        self.fd = fd;
        ctx.add_user_fd(fd, true, false)?;
        ctx.create_timer(TIMER_POLL, ClockDomain::Monotonic)?;
        ctx.start_timer(TIMER_POLL, TimerSpec::periodic(POLL_INTERVAL))?;
        Ok(())
    }

    fn on_shutdown(&mut self, ctx: &mut ThreadContext) {
        if self.fd >= 0 {
            let _ = ctx.remove_user_fd(self.fd);
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }

    fn control(&mut self, mask: ControlFlags, flags: ControlFlags) {
        self.control = (self.control - mask) | (flags & mask);
    }

    fn status(&self) -> SyncInstanceStatus {
        let mut s =
            SyncInstanceStatus::new(&self.cfg.name, ModuleKind::NtpHelper, self.cfg.priority);
        s.state = match &self.report {
            Some(r) if r.synchronized && r.stratum < 16 => SyncState::Slave,
            Some(_) => SyncState::Listening,
            None => SyncState::Listening,
        };
        s.alarms = self.alarms;
        s.clock = Some(self.services.registry.system_clock());
        s.offset_from_master_ns = self
            .report
            .as_ref()
            .map_or(0.0, |r| r.offset_s * 1.0e9);
        s.last_measurement = self.last_measurement;
        s.grandmaster = self.grandmaster();
        s.local_accuracy_ns = self.grandmaster().accuracy_ns;
        s.control = self.control;
        s
    }

    fn step_clock(&mut self, offset: TimeSpec) -> Result<()> {
        // The helper applies steps with its own privileges.
        self.send_line(&format!("STEP {}\n", offset))
    }

    fn update_grandmaster(&mut self, _info: &GrandmasterInfo) {}

    fn update_leap(&mut self, leap59: bool, leap61: bool) {
        if leap59 || leap61 {
            let _ = self.send_line(&format!(
                "LEAP {}\n",
                if leap61 { "61" } else { "59" }
            ));
        }
    }

    fn save_state(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_state_header(w, &self.status())?;
        writeln!(w, "module: ntp_helper")?;
        if let Some(r) = &self.report {
            writeln!(w, "stratum: {}", r.stratum)?;
            writeln!(w, "source: {}", r.source)?;
        }
        Ok(())
    }

    fn write_topology(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            w,
            "ntp-helper({HELPER_SOCKET_PATH}) -> {}",
            self.report.as_ref().map_or("?", |r| r.source.as_str())
        )
    }

    fn on_timer(&mut self, _ctx: &mut ThreadContext, id: TimerId, _expiries: u64) {
        if id == TIMER_POLL {
            self.poll_helper();
        }
    }

    fn on_user_fds(&mut self, _ctx: &mut ThreadContext, ready: &[Readiness]) {
        for r in ready {
            if r.fd == self.fd && r.readable {
                self.read_replies();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report_full() {
        let r = parse_report("offset=-0.002500\nstratum=2\nsource=192.0.2.1\nsynchronized=1\n");
        assert_eq!(r.stratum, 2);
        assert_eq!(r.source, "192.0.2.1");
        assert!(r.synchronized);
        assert!((r.offset_s + 0.0025).abs() < 1e-12);
    }

    #[test]
    fn test_parse_report_ignores_junk() {
        let r = parse_report("hello\nstratum=abc\noffset=0.5\n");
        assert_eq!(r.stratum, 16);
        assert!((r.offset_s - 0.5).abs() < 1e-12);
        assert!(!r.synchronized);
    }

    #[test]
    fn test_grandmaster_class_tracks_stratum() {
        let mut r = HelperReport::default();
        r.stratum = 3;
        r.synchronized = true;
        let gm_for = |report: HelperReport| {
            let mut m = NtpModule::new(
                InstanceConfig {
                    name: "ntp".into(),
                    module: ModuleKind::NtpHelper,
                    interface: None,
                    priority: 200,
                    ptp: Default::default(),
                    clock: None,
                },
                ModuleServices {
                    registry: std::sync::Arc::new(crate::clocks::ClockRegistry::new(
                        std::sync::Arc::new(crate::clocks::HardwareLock::new()),
                    )),
                    tables: std::sync::Arc::new(crate::link::LinkTableSet::new()),
                    state_dir: std::env::temp_dir(),
                },
            );
            m.report = Some(report);
            m.grandmaster()
        };
        let gm = gm_for(r);
        assert_eq!(gm.clock_class, 83);
        assert_eq!(gm.steps_removed, 3);
        assert!(gm.time_traceable);
    }
}
