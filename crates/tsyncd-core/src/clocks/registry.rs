//! Clock enumeration and the discipline surface.
//!
//! Candidate clocks come from the current link table: any interface with a
//! PHC gets (or joins) a hardware clock keyed by its stable hardware id; a
//! private adapter timestamping interface upgrades the kind. Enumeration runs
//! at startup and again on every hotplug; clocks are never destroyed before
//! daemon exit, so consumers may hold their references across table versions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::clocks::hwlock::HardwareLock;
use crate::clocks::{Clock, ClockKind, HwId};
use crate::error::Result;
use crate::link::LinkTable;
use crate::time::TimeSpec;

// Solarflare-style private timestamping ioctl probe.
const SIOCDEVPRIVATE: libc::c_ulong = 0x89f0;
const EFX_TS_PROBE: libc::c_ulong = SIOCDEVPRIVATE + 3;

/// Probe an interface for the adapter's private timestamping interface.
fn probe_efx(ifname: &str) -> bool {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return false;
    }
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in ifname.bytes().take(libc::IFNAMSIZ - 1).enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }
    let rc = unsafe { libc::ioctl(fd, EFX_TS_PROBE, &mut ifr) };
    unsafe { libc::close(fd) };
    rc == 0
}

/// Owns every logical clock in the process.
pub struct ClockRegistry {
    hwlock: Arc<HardwareLock>,
    system: Arc<Clock>,
    clocks: Mutex<HashMap<HwId, Arc<Clock>>>,
    /// ifindex -> hwid resolution from the last enumeration.
    by_ifindex: Mutex<HashMap<i32, HwId>>,
}

impl ClockRegistry {
    pub fn new(hwlock: Arc<HardwareLock>) -> Self {
        Self {
            hwlock,
            system: Arc::new(Clock::system()),
            clocks: Mutex::new(HashMap::new()),
            by_ifindex: Mutex::new(HashMap::new()),
        }
    }

    pub fn hardware_lock(&self) -> &Arc<HardwareLock> {
        &self.hwlock
    }

    pub fn system_clock(&self) -> Arc<Clock> {
        Arc::clone(&self.system)
    }

    /// Enumerate candidate clocks from a link table. Existing clocks are
    /// kept; new hardware ids create clocks, and interfaces sharing a clock
    /// join its index list.
    pub fn enumerate(&self, table: &LinkTable) -> Result<()> {
        let _guard = self.hwlock.lock();
        let mut clocks = self.clocks.lock().unwrap();
        let mut by_ifindex = self.by_ifindex.lock().unwrap();
        by_ifindex.clear();

        for link in table.rows() {
            if !link.has_phc() || link.perm_addr == [0u8; 6] {
                continue;
            }
            let hwid = HwId::from_mac(link.perm_addr);
            by_ifindex.insert(link.ifindex, hwid);
            if let Some(existing) = clocks.get(&hwid) {
                existing.add_ifindex(link.ifindex);
                continue;
            }
            let kind = if probe_efx(&link.name) {
                ClockKind::PhcAndEfx
            } else {
                ClockKind::PhcOnly
            };
            match Clock::open_phc(hwid, kind, link.phc_index, &link.name, link.ifindex) {
                Ok(clock) => {
                    log::info!(
                        "clock registry: new {kind} clock {} for {} (phc{})",
                        hwid,
                        link.name,
                        link.phc_index
                    );
                    clocks.insert(hwid, Arc::new(clock));
                }
                Err(e) => {
                    log::warn!(
                        "clock registry: cannot open phc{} for {}: {e}",
                        link.phc_index,
                        link.name
                    );
                }
            }
        }
        Ok(())
    }

    pub fn find_by_hwid(&self, hwid: HwId) -> Option<Arc<Clock>> {
        if hwid.is_system() {
            return Some(self.system_clock());
        }
        self.clocks.lock().unwrap().get(&hwid).cloned()
    }

    pub fn find_by_ifindex(&self, ifindex: i32) -> Option<Arc<Clock>> {
        let hwid = *self.by_ifindex.lock().unwrap().get(&ifindex)?;
        self.find_by_hwid(hwid)
    }

    /// Every hardware clock, plus the system clock first.
    pub fn all(&self) -> Vec<Arc<Clock>> {
        let clocks = self.clocks.lock().unwrap();
        let mut out = Vec::with_capacity(clocks.len() + 1);
        out.push(self.system_clock());
        let mut hw: Vec<_> = clocks.values().cloned().collect();
        hw.sort_by_key(|c| c.hwid());
        out.extend(hw);
        out
    }

    /// Set `clock` to an absolute time from `source`.
    pub fn set_time(
        &self,
        clock: &Clock,
        source: &str,
        time: TimeSpec,
        step_only: bool,
    ) -> Result<()> {
        let _guard = self.hwlock.lock();
        log::info!(
            "clock {}: set from {source} to {time}{}",
            clock.long_name(),
            if step_only { " (step only)" } else { "" }
        );
        clock.set_time(time)
    }

    /// Step `clock` by a signed offset.
    pub fn adjust_time(&self, clock: &Clock, offset: TimeSpec) -> Result<()> {
        let _guard = self.hwlock.lock();
        clock.adjust_time(offset)
    }

    /// Slew `clock` at `ppb`.
    pub fn adjust_frequency(&self, clock: &Clock, ppb: f64) -> Result<()> {
        let _guard = self.hwlock.lock();
        clock.adjust_frequency(ppb)
    }

    /// Step every clock by the offset between it and the system clock,
    /// aligning the estate. Clocks in `exclude` are skipped: a clock being
    /// actively disciplined against a reference must not also be yanked to
    /// the system clock. Returns the number of clocks stepped (or attempted).
    /// Used by the `stepclocks` command and SIGUSR1.
    pub fn step_all_to_system(&self, exclude: &HashSet<HwId>) -> Result<usize> {
        let _guard = self.hwlock.lock();
        let sys_now = self.system.read_time()?;
        let mut stepped = 0;
        for clock in self.clocks.lock().unwrap().values() {
            if exclude.contains(&clock.hwid()) {
                log::debug!(
                    "clock {}: under active control, skipping system alignment",
                    clock.long_name()
                );
                continue;
            }
            match clock.read_time() {
                Ok(now) => {
                    let offset = sys_now - now;
                    if !offset.is_zero() {
                        stepped += 1;
                        if let Err(e) = clock.adjust_time(offset) {
                            log::warn!(
                                "clock {}: step to system failed: {e}",
                                clock.long_name()
                            );
                        }
                    }
                }
                Err(e) => {
                    log::warn!("clock {}: read failed: {e}", clock.long_name());
                }
            }
        }
        Ok(stepped)
    }

    /// Register a clock directly, bypassing device probing.
    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, clock: Clock) {
        self.clocks
            .lock()
            .unwrap()
            .insert(clock.hwid(), Arc::new(clock));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;

    fn table_with_phc() -> LinkTable {
        let mut l = Link::new(2, "eth0");
        l.phc_index = 0;
        l.perm_addr = [0, 0x0f, 0x53, 1, 2, 3];
        LinkTable::new(1, vec![l])
    }

    #[test]
    fn test_system_clock_always_present() {
        let reg = ClockRegistry::new(Arc::new(HardwareLock::new()));
        assert!(reg.system_clock().is_system());
        assert!(reg.find_by_hwid(HwId::SYSTEM).unwrap().is_system());
        assert_eq!(reg.all().len(), 1);
    }

    #[test]
    fn test_enumeration_skips_interfaces_without_phc() {
        let reg = ClockRegistry::new(Arc::new(HardwareLock::new()));
        let table = LinkTable::new(1, vec![Link::new(2, "eth0")]);
        reg.enumerate(&table).unwrap();
        // Only the system clock: eth0 has no PHC.
        assert_eq!(reg.all().len(), 1);
    }

    #[test]
    fn test_enumeration_tolerates_missing_device() {
        // /dev/ptp0 may not exist in the test environment; enumeration must
        // survive either way and never lose the system clock.
        let reg = ClockRegistry::new(Arc::new(HardwareLock::new()));
        reg.enumerate(&table_with_phc()).unwrap();
        assert!(!reg.all().is_empty());
    }

    #[test]
    fn test_step_all_skips_excluded_clocks() {
        let reg = ClockRegistry::new(Arc::new(HardwareLock::new()));
        let a = HwId::from_mac([0, 0x0f, 0x53, 0, 0, 1]);
        let b = HwId::from_mac([0, 0x0f, 0x53, 0, 0, 2]);
        reg.insert_for_tests(Clock::fake(a, "phc-a"));
        reg.insert_for_tests(Clock::fake(b, "phc-b"));

        // Both clocks sit far from the system clock, so both are candidates.
        assert_eq!(reg.step_all_to_system(&HashSet::new()).unwrap(), 2);

        // A clock under active instance control is left alone.
        let mut exclude = HashSet::new();
        exclude.insert(a);
        assert_eq!(reg.step_all_to_system(&exclude).unwrap(), 1);

        // Excluding everything steps nothing.
        exclude.insert(b);
        assert_eq!(reg.step_all_to_system(&exclude).unwrap(), 0);
    }
}
