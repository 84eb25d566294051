//! Freerun sync module: a local clock presented as the reference.
//!
//! Selects a local reference clock — the system clock, a named clock, or the
//! best hardware clock found by walking down a bond/VLAN stack — and reports
//! a steady slave status with no alarms. Beyond an initial alignment of the
//! chosen hardware clock to system time, it never adjusts anything.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use crate::clocks::{Clock, ClockClass};
use crate::config::{InstanceConfig, ModuleKind};
use crate::error::{Error, Result};
use crate::link::LinkTable;
use crate::runtime::ThreadContext;
use crate::sync::status::{
    Alarm, ControlFlags, GrandmasterInfo, SyncInstanceStatus, SyncState,
};
use crate::sync::{write_state_header, ModuleServices, SyncModule};
use crate::time::{ClockDomain, TimeSpec};

/// Depth cap for the bond/VLAN descent.
const MAX_DESCENT_DEPTH: usize = 8;

pub struct FreerunModule {
    cfg: InstanceConfig,
    services: ModuleServices,
    clock: Option<Arc<Clock>>,
    control: ControlFlags,
    alarms: Alarm,
    aligned: bool,
}

impl FreerunModule {
    pub fn new(cfg: InstanceConfig, services: ModuleServices) -> Self {
        Self {
            cfg,
            services,
            clock: None,
            control: ControlFlags::TIMESTAMP_PROCESSING,
            alarms: Alarm::empty(),
            aligned: false,
        }
    }

    /// Walk down from `start` through VLAN parents and aggregate slaves,
    /// collecting every PHC-bearing interface. Iterative with a visited set,
    /// so stacking cycles cannot recurse forever.
    fn descend(&self, table: &LinkTable, start: i32) -> Vec<i32> {
        let mut stack = vec![(start, 0usize)];
        let mut visited = HashSet::new();
        let mut found = Vec::new();
        while let Some((ifindex, depth)) = stack.pop() {
            if depth > MAX_DESCENT_DEPTH || !visited.insert(ifindex) {
                continue;
            }
            let Some(link) = table.by_index(ifindex) else {
                continue;
            };
            if link.has_phc() {
                found.push(ifindex);
            }
            if link.kind.is_aggregate() {
                for slave in table.slaves_of(ifindex) {
                    stack.push((slave.ifindex, depth + 1));
                }
            } else if link.parent_ifindex != 0 {
                stack.push((link.parent_ifindex, depth + 1));
            }
        }
        found
    }

    /// Rank a clock for reference selection: discipline class first, then
    /// accuracy, then stratum.
    fn rank(clock: &Clock) -> (u8, f64, u8) {
        (
            clock.class().rank(),
            clock.accuracy_ns().unwrap_or(f64::INFINITY),
            clock.stratum(),
        )
    }

    fn resolve(&mut self, table: Option<&LinkTable>) -> Result<()> {
        let registry = &self.services.registry;

        let clock = match self.cfg.clock.as_deref() {
            Some("system") => Some(registry.system_clock()),
            Some(name) => {
                let table = table.ok_or(Error::TryAgain("no link table yet"))?;
                let link = table
                    .by_name(name)
                    .ok_or_else(|| Error::NoSuchDevice(name.to_string()))?;
                registry.find_by_ifindex(link.ifindex)
            }
            None => match (&self.cfg.interface, table) {
                (Some(ifname), Some(table)) => {
                    let link = table
                        .by_name(ifname)
                        .ok_or_else(|| Error::NoSuchDevice(ifname.clone()))?;
                    let mut candidates: Vec<Arc<Clock>> = self
                        .descend(table, link.ifindex)
                        .into_iter()
                        .filter_map(|idx| registry.find_by_ifindex(idx))
                        .collect();
                    candidates.sort_by(|a, b| {
                        Self::rank(a)
                            .partial_cmp(&Self::rank(b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    candidates.into_iter().next()
                }
                _ => Some(registry.system_clock()),
            },
        };

        match clock {
            Some(clock) => {
                if self
                    .clock
                    .as_ref()
                    .map_or(true, |c| c.hwid() != clock.hwid())
                {
                    log::info!(
                        "freerun {}: selected reference clock {} ({})",
                        self.cfg.name,
                        clock.long_name(),
                        clock.hwid()
                    );
                }
                self.alarms.remove(Alarm::INTERFACE_GONE);
                self.align_once(&clock);
                self.clock = Some(clock);
                Ok(())
            }
            None => {
                self.alarms.insert(Alarm::INTERFACE_GONE);
                Err(Error::NoSuchDevice(
                    self.cfg.interface.clone().unwrap_or_default(),
                ))
            }
        }
    }

    /// One-time alignment of a hardware reference to system time.
    fn align_once(&mut self, clock: &Arc<Clock>) {
        if self.aligned || clock.is_system() {
            return;
        }
        self.aligned = true;
        let sys = self.services.registry.system_clock();
        match sys.read_time() {
            Ok(now) => {
                if let Err(e) = self.services.registry.set_time(clock, "system", now, false) {
                    log::warn!("freerun {}: initial alignment failed: {e}", self.cfg.name);
                }
            }
            Err(e) => log::warn!("freerun {}: system clock read failed: {e}", self.cfg.name),
        }
    }

    fn grandmaster(&self) -> GrandmasterInfo {
        let Some(clock) = &self.clock else {
            return GrandmasterInfo::default();
        };
        let (time_tr, freq_tr) = clock.traceability();
        GrandmasterInfo {
            clock_id: clock.hwid(),
            clock_class: match clock.class() {
                ClockClass::Locked => 6,
                ClockClass::Holdover => 7,
                ClockClass::Freerunning => 248,
            },
            time_source: 0xa0,
            accuracy_ns: clock.accuracy_ns().unwrap_or(f64::INFINITY),
            variance: 0xffff,
            steps_removed: 0,
            time_traceable: time_tr,
            freq_traceable: freq_tr,
        }
    }
}

impl SyncModule for FreerunModule {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn on_startup(&mut self, _ctx: &mut ThreadContext) -> Result<()> {
        let latest = self.services.tables.latest_version();
        let table = self.services.tables.get(latest);
        match self.resolve(table.as_deref()) {
            Ok(()) => Ok(()),
            // Resolution retries on the next link-table version.
            Err(e) if e.is_transient() => Ok(()),
            Err(e) => {
                // A named clock that can never appear is a startup failure
                // only when the configuration asked for it explicitly.
                if self.cfg.clock.is_some() {
                    Err(e)
                } else {
                    log::warn!("freerun {}: reference pending: {e}", self.cfg.name);
                    Ok(())
                }
            }
        }
    }

    fn control(&mut self, mask: ControlFlags, flags: ControlFlags) {
        self.control = (self.control - mask) | (flags & mask);
    }

    fn status(&self) -> SyncInstanceStatus {
        let mut s = SyncInstanceStatus::new(&self.cfg.name, ModuleKind::Freerun, self.cfg.priority);
        s.state = if self.clock.is_some() {
            SyncState::Slave
        } else {
            SyncState::Listening
        };
        s.alarms = self.alarms;
        s.clock = self.clock.clone();
        s.offset_from_master_ns = 0.0;
        s.last_measurement = Some(TimeSpec::now(ClockDomain::Monotonic));
        s.grandmaster = self.grandmaster();
        s.local_accuracy_ns = self
            .clock
            .as_ref()
            .and_then(|c| c.accuracy_ns())
            .unwrap_or(f64::INFINITY);
        s.control = self.control;
        s
    }

    fn step_clock(&mut self, offset: TimeSpec) -> Result<()> {
        let Some(clock) = &self.clock else {
            return Ok(());
        };
        self.services.registry.adjust_time(clock, offset)
    }

    fn update_grandmaster(&mut self, _info: &GrandmasterInfo) {
        // Freerun presents its own local clock; downstream consistency is
        // reported through status only.
    }

    fn update_leap(&mut self, _leap59: bool, _leap61: bool) {}

    fn save_state(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_state_header(w, &self.status())?;
        writeln!(w, "module: freerun")
    }

    fn write_topology(&self, w: &mut dyn Write) -> std::io::Result<()> {
        match &self.clock {
            Some(c) => writeln!(w, "freerun -> {} [{}]", c.long_name(), c.hwid()),
            None => writeln!(w, "freerun -> (unresolved)"),
        }
    }

    fn wants_link_tables(&self) -> bool {
        true
    }

    fn on_link_table(&mut self, _ctx: &mut ThreadContext, table: &LinkTable) {
        if let Err(e) = self.resolve(Some(table)) {
            log::debug!("freerun {}: resolution: {e}", self.cfg.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::{ClockRegistry, HardwareLock};
    use crate::link::{Link, LinkKind, LinkTableSet};

    fn services() -> ModuleServices {
        ModuleServices {
            registry: Arc::new(ClockRegistry::new(Arc::new(HardwareLock::new()))),
            tables: Arc::new(LinkTableSet::new()),
            state_dir: std::env::temp_dir(),
        }
    }

    fn cfg(name: &str, clock: Option<&str>, interface: Option<&str>) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            module: ModuleKind::Freerun,
            interface: interface.map(str::to_string),
            priority: 128,
            ptp: Default::default(),
            clock: clock.map(str::to_string),
        }
    }

    #[test]
    fn test_system_clock_reference() {
        let mut m = FreerunModule::new(cfg("fr", Some("system"), None), services());
        m.resolve(None).unwrap();
        let s = m.status();
        assert_eq!(s.state, SyncState::Slave);
        assert!(s.alarms.is_empty());
        assert!(s.clock.unwrap().is_system());
        assert_eq!(s.offset_from_master_ns, 0.0);
    }

    #[test]
    fn test_descent_collects_phc_slaves_through_bond() {
        let m = FreerunModule::new(cfg("fr", None, Some("bond0")), services());
        let mut bond = Link::new(10, "bond0");
        bond.kind = LinkKind::Bond;
        let mut s0 = Link::new(2, "eth0");
        s0.master_ifindex = 10;
        s0.phc_index = 0;
        let mut s1 = Link::new(3, "eth1");
        s1.master_ifindex = 10;
        s1.phc_index = 1;
        let table = LinkTable::new(1, vec![bond, s0, s1]);
        let mut found = m.descend(&table, 10);
        found.sort();
        assert_eq!(found, vec![2, 3]);
    }

    #[test]
    fn test_descent_survives_stacking_cycle() {
        let m = FreerunModule::new(cfg("fr", None, Some("vlan0")), services());
        // Two VLANs pointing at each other: pathological, must terminate.
        let mut a = Link::new(5, "vlan0");
        a.kind = LinkKind::Vlan;
        a.parent_ifindex = 6;
        let mut b = Link::new(6, "vlan1");
        b.kind = LinkKind::Vlan;
        b.parent_ifindex = 5;
        let table = LinkTable::new(1, vec![a, b]);
        assert!(m.descend(&table, 5).is_empty());
    }

    #[test]
    fn test_grandmaster_reports_own_identity() {
        let mut m = FreerunModule::new(cfg("fr", Some("system"), None), services());
        m.resolve(None).unwrap();
        let gm = m.grandmaster();
        assert!(gm.clock_id.is_system());
        assert_eq!(gm.steps_removed, 0);
        // System clock defaults to freerunning.
        assert_eq!(gm.clock_class, 248);
    }
}
