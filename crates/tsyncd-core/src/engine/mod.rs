//! The engine: top-level coordinator thread.
//!
//! Owns the clock registry, the servos, the selector and every sync-module
//! thread. Each selection interval it polls instance statuses, runs the
//! selector, flips clock-control flags so exactly the elected instance may
//! adjust, distributes grandmaster and leap-second state, and drives the
//! elected servo. It also serves the control socket, emits periodic
//! statistics and re-enumerates clocks on hotplug.

pub mod control;
pub mod persist;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::clocks::{ClockRegistry, HardwareLock};
use crate::config::{Config, InstanceConfig, ModuleKind};
use crate::error::Result;
use crate::link::{LinkEngine, LinkTableSet};
use crate::message::multicast::MulticastBus;
use crate::message::pool::PoolSet;
use crate::message::{msg_id, Body, Msg};
use crate::runtime::signals::{daemon_signals, SignalSet};
use crate::runtime::timer::{TimerId, TimerSpec};
use crate::runtime::{Readiness, Runtime, ThreadContext, ThreadHandle, ThreadHandlers};
use crate::selector::Selector;
use crate::servo::{Correction, Servo, ServoCtl};
use crate::sync::freerun::FreerunModule;
use crate::sync::ntp::NtpModule;
use crate::sync::pps::PpsModule;
use crate::sync::ptp::PtpModule;
use crate::sync::{ControlFlags, InstanceThread, ModuleServices, SyncInstanceStatus, SyncState};
use crate::time::{ClockDomain, TimeSpec};

use control::{ControlCommand, ControlSocket};
use persist::LockFile;

const TIMER_SELECTION: TimerId = TimerId(1);
const TIMER_STATS: TimerId = TimerId(2);
const TIMER_SAVE_STATE: TimerId = TimerId(3);

/// How long a status poll may take before the instance counts as absent.
const STATUS_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Guard window before a UTC midnight leap event.
const LEAP_GUARD_WINDOW_S: i64 = 10;

struct InstanceRef {
    name: String,
    kind: ModuleKind,
    priority: u8,
    handle: ThreadHandle,
}

/// Top-level daemon state, run as the root thread's handlers.
pub struct Engine {
    cfg: Config,
    runtime: Runtime,
    services: ModuleServices,
    signals: Option<SignalSet>,
    lock: Option<LockFile>,
    control_sock: Option<ControlSocket>,
    netlink: Option<ThreadHandle>,
    instances: Vec<InstanceRef>,
    statuses: Vec<SyncInstanceStatus>,
    selector: Selector,
    servos: HashMap<String, Servo>,
    leap59: bool,
    leap61: bool,
    leap_guard_asserted: bool,
}

impl Engine {
    pub fn new(
        cfg: Config,
        runtime: Runtime,
        services: ModuleServices,
        signals: Option<SignalSet>,
    ) -> Self {
        Self {
            cfg,
            runtime,
            services,
            signals,
            lock: None,
            control_sock: None,
            netlink: None,
            instances: Vec::new(),
            statuses: Vec::new(),
            selector: Selector::new(),
            servos: HashMap::new(),
            leap59: false,
            leap61: false,
            leap_guard_asserted: false,
        }
    }

    fn spawn_instances(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        let configs: Vec<InstanceConfig> = self.cfg.instances.clone();
        for ic in configs {
            let services = self.services.clone();
            let name = ic.name.clone();
            let kind = ic.module;
            let priority = ic.priority;
            let parent = Some(ctx.mailbox().clone());
            let handle = match kind {
                ModuleKind::Freerun => self.runtime.spawn(
                    &name,
                    InstanceThread::new(FreerunModule::new(ic, services.clone()), services),
                    parent,
                ),
                ModuleKind::Pps => self.runtime.spawn(
                    &name,
                    InstanceThread::new(PpsModule::new(ic, services.clone()), services),
                    parent,
                ),
                ModuleKind::Ptp => self.runtime.spawn(
                    &name,
                    InstanceThread::new(PtpModule::new(ic, services.clone()), services),
                    parent,
                ),
                ModuleKind::NtpHelper => self.runtime.spawn(
                    &name,
                    InstanceThread::new(NtpModule::new(ic, services.clone()), services),
                    parent,
                ),
            }?;
            log::info!("engine: instance '{name}' ({kind}) started");
            self.instances.push(InstanceRef {
                name,
                kind,
                priority,
                handle,
            });
        }
        Ok(())
    }

    /// Poll every instance for its current status over the synchronous
    /// channel. An unresponsive instance reports as faulty this tick.
    fn poll_statuses(&mut self, ctx: &mut ThreadContext) {
        let mut out = Vec::with_capacity(self.instances.len());
        for inst in &self.instances {
            let status = ctx
                .alloc_global("poll_statuses")
                .and_then(|msg| {
                    ctx.send_wait(&inst.handle, msg, msg_id::STATUS_GET, STATUS_POLL_TIMEOUT)
                })
                .ok()
                .and_then(|mut reply| match std::mem::take(&mut reply.body) {
                    Body::Status(s) => Some(*s),
                    _ => None,
                });
            match status {
                Some(s) => out.push(s),
                None => {
                    log::warn!("engine: instance '{}' did not answer status poll", inst.name);
                    let mut s = SyncInstanceStatus::new(&inst.name, inst.kind, inst.priority);
                    s.state = SyncState::Faulty;
                    out.push(s);
                }
            }
        }
        self.statuses = out;
    }

    fn send_body(&self, ctx: &ThreadContext, inst: &InstanceRef, id: crate::message::MsgId, body: Body) {
        match ctx.alloc_global("engine_send") {
            Ok(mut msg) => {
                msg.body = body;
                if let Err(e) = ctx.send(&inst.handle, msg, id) {
                    log::warn!("engine: send {id} to '{}' failed: {e}", inst.name);
                }
            }
            Err(e) => log::warn!("engine: allocation for '{}' failed: {e}", inst.name),
        }
    }

    /// Flip control flags after an election change: the elected instance
    /// gets clock control, everyone else keeps observing with processing
    /// live but control off.
    fn apply_selection(&mut self, ctx: &ThreadContext, elected: Option<usize>) {
        for (i, inst) in self.instances.iter().enumerate() {
            let mask = ControlFlags::CLOCK_CONTROL_ENABLED | ControlFlags::TIMESTAMP_PROCESSING;
            let flags = if Some(i) == elected {
                ControlFlags::CLOCK_CONTROL_ENABLED | ControlFlags::TIMESTAMP_PROCESSING
            } else {
                ControlFlags::TIMESTAMP_PROCESSING
            };
            self.send_body(ctx, inst, msg_id::CONTROL, Body::Control { mask, flags });
            if let Some(servo) = self.servos.get_mut(&inst.name) {
                servo.control(
                    ServoCtl::CLOCK_CONTROL_ENABLED,
                    if Some(i) == elected {
                        ServoCtl::CLOCK_CONTROL_ENABLED
                    } else {
                        ServoCtl::empty()
                    },
                );
            }
        }
    }

    /// Give every secondary the elected instance's grandmaster view.
    fn distribute_grandmaster(&self, ctx: &ThreadContext, elected: usize) {
        let gm = self.statuses[elected].grandmaster.clone();
        for (i, inst) in self.instances.iter().enumerate() {
            if i == elected {
                continue;
            }
            self.send_body(
                ctx,
                inst,
                msg_id::GRANDMASTER_UPDATE,
                Body::Grandmaster(Box::new(gm.clone())),
            );
        }
    }

    /// Leap-second bookkeeping: learn pending leap flags from the elected
    /// instance, distribute them, and assert the guard over the window
    /// around the leap edge.
    fn propagate_leap(&mut self, ctx: &ThreadContext, elected: usize) {
        let s = &self.statuses[elected];
        if (s.leap59, s.leap61) != (self.leap59, self.leap61) {
            self.leap59 = s.leap59;
            self.leap61 = s.leap61;
            log::info!(
                "engine: leap pending now leap59={} leap61={}",
                self.leap59,
                self.leap61
            );
            for inst in &self.instances {
                self.send_body(
                    ctx,
                    inst,
                    msg_id::LEAP_UPDATE,
                    Body::Leap {
                        leap59: self.leap59,
                        leap61: self.leap61,
                    },
                );
            }
        }

        let pending = self.leap59 || self.leap61;
        let in_window = pending && {
            let now = TimeSpec::now(ClockDomain::Realtime);
            let into_day = now.sec.rem_euclid(86_400);
            into_day >= 86_400 - LEAP_GUARD_WINDOW_S
        };
        let after_leap = self.leap_guard_asserted && !in_window;
        if in_window && !self.leap_guard_asserted {
            log::warn!("engine: asserting leap second guard");
            self.set_leap_guard(ctx, true);
        } else if after_leap {
            log::info!("engine: clearing leap second guard");
            self.set_leap_guard(ctx, false);
            self.leap59 = false;
            self.leap61 = false;
        }
    }

    fn set_leap_guard(&mut self, ctx: &ThreadContext, assert: bool) {
        self.leap_guard_asserted = assert;
        let flags = if assert {
            ControlFlags::LEAP_SECOND_GUARD
        } else {
            ControlFlags::empty()
        };
        for inst in &self.instances {
            self.send_body(
                ctx,
                inst,
                msg_id::CONTROL,
                Body::Control {
                    mask: ControlFlags::LEAP_SECOND_GUARD,
                    flags,
                },
            );
        }
        let servo_flags = if assert {
            ServoCtl::LEAP_SECOND_GUARD
        } else {
            ServoCtl::empty()
        };
        for servo in self.servos.values_mut() {
            servo.control(ServoCtl::LEAP_SECOND_GUARD, servo_flags);
        }
    }

    /// Feed the elected instance's offset into its servo and apply the
    /// resulting correction to its clock.
    fn drive_servo(&mut self, elected: usize) {
        let status = &self.statuses[elected];
        let Some(clock) = status.clock.clone() else {
            return;
        };
        let Some(ts) = status.last_measurement else {
            return;
        };
        let name = status.name.clone();
        let servo = self
            .servos
            .entry(name.clone())
            .or_insert_with(|| {
                let mut s = Servo::new(&name, &self.cfg.servo);
                s.control(ServoCtl::CLOCK_CONTROL_ENABLED, ServoCtl::CLOCK_CONTROL_ENABLED);
                s
            });
        match servo.update(status.offset_from_master_ns as i64, ts) {
            Correction::None => {}
            Correction::Step(amount) => {
                if let Err(e) = self.services.registry.adjust_time(&clock, amount) {
                    log::error!("engine: step of {} failed: {e}", clock.long_name());
                }
            }
            Correction::Slew(ppb) => {
                if let Err(e) = self.services.registry.adjust_frequency(&clock, ppb) {
                    log::error!("engine: slew of {} failed: {e}", clock.long_name());
                }
            }
        }
    }

    /// One selection tick.
    fn tick(&mut self, ctx: &mut ThreadContext) {
        self.poll_statuses(ctx);
        let selection = self.selector.select(&self.statuses);
        if selection.changed {
            self.apply_selection(ctx, selection.index);
        }
        if let Some(elected) = selection.index {
            self.distribute_grandmaster(ctx, elected);
            self.propagate_leap(ctx, elected);
            self.drive_servo(elected);
            let s = &self.statuses[elected];
            let stats = Body::RtStats {
                instance: s.name.clone(),
                offset_ns: s.offset_from_master_ns,
                in_sync: s.is_clean_slave(),
            };
            if let Err(e) = ctx.bus().send(msg_id::RT_STATS, &stats, false) {
                log::debug!("engine: rt-stats multicast: {e}");
            }
        }
    }

    fn emit_stats(&self) {
        let version = self.services.tables.latest_version();
        log::info!("--- statistics (link table v{version}) ---");
        for s in &self.statuses {
            log::info!(
                "  {}: state {} alarms [{}] offset {:.1}ns gm {} class {}",
                s.name,
                s.state,
                s.alarms,
                s.offset_from_master_ns,
                s.grandmaster.clock_id,
                s.grandmaster.clock_class
            );
        }
        for (name, servo) in &self.servos {
            let c = servo.counters();
            log::info!(
                "  servo {name}: steps {} outliers {}/{} mpd {:.1}ns",
                c.clock_steps,
                c.outliers,
                c.outliers_num_samples,
                servo.mean_path_delay()
            );
        }
    }

    fn save_states(&self, ctx: &ThreadContext) {
        for inst in &self.instances {
            self.send_body(ctx, inst, msg_id::SAVE_STATE, Body::Empty);
        }
    }

    /// Step every clock to the current reference: the elected instance steps
    /// its own clock by its measured offset, everything else aligns to the
    /// system clock. The elected instance's clock is excluded from the
    /// system alignment pass so it is never commanded to two targets.
    /// Returns how many clocks were aligned to the system clock.
    fn step_clocks_now(&mut self, ctx: &ThreadContext) -> usize {
        let mut under_control = HashSet::new();
        if let Some(elected) = self.selector.selected() {
            if let Some(s) = self.statuses.get(elected) {
                let offset = TimeSpec::from_ns(-(s.offset_from_master_ns as i64));
                if let Some(clock) = &s.clock {
                    under_control.insert(clock.hwid());
                }
                if let Some(inst) = self.instances.get(elected) {
                    self.send_body(ctx, inst, msg_id::STEP_CLOCK, Body::StepClock { offset });
                }
            }
        }
        match self.services.registry.step_all_to_system(&under_control) {
            Ok(aligned) => {
                log::info!("engine: aligned {aligned} clocks to system");
                aligned
            }
            Err(e) => {
                log::warn!("engine: step all clocks: {e}");
                0
            }
        }
    }

    fn dump_tables(&self, ctx: &ThreadContext) {
        let version = self.services.tables.latest_version();
        if let Some(table) = self.services.tables.get(version) {
            for row in table.rows() {
                let json = serde_json::json!({
                    "ifindex": row.ifindex,
                    "name": row.name,
                    "kind": row.kind.to_string(),
                    "running": row.is_running(),
                    "master": row.master_ifindex,
                    "bond_mode": row.bond_mode.to_string(),
                    "active_slave": row.active_slave_ifindex,
                    "slave": row.is_slave,
                    "vlan": row.vlan_id,
                    "phc": row.phc_index,
                });
                log::info!("link v{version}: {json}");
            }
        }
        for clock in self.services.registry.all() {
            let json = serde_json::json!({
                "clock": clock.long_name(),
                "hwid": clock.hwid().to_string(),
                "kind": clock.kind().to_string(),
                "class": clock.class().to_string(),
                "freq_adj_ppb": clock.freq_adj_ppb(),
                "steps": clock.step_count(),
            });
            log::info!("clock: {json}");
        }
        for inst in &self.instances {
            self.send_body(ctx, inst, msg_id::WRITE_TOPOLOGY, Body::Empty);
        }
    }

    fn handle_command(&mut self, ctx: &mut ThreadContext, line: &str) -> String {
        match control::parse_command(line) {
            Ok(ControlCommand::Exit) => {
                log::info!("control: exit requested");
                ctx.exit(0);
                "exiting\n".into()
            }
            Ok(ControlCommand::LogRotate) => {
                // Rotation mechanics live outside the core; the daemon only
                // acknowledges the request so the rotator can proceed.
                log::info!("control: log rotation requested");
                "logs rotated\n".into()
            }
            Ok(ControlCommand::StepClocks) => {
                log::info!("control: stepping clocks now");
                let aligned = self.step_clocks_now(ctx);
                format!("clocks stepped ({aligned} aligned to system)\n")
            }
            Ok(ControlCommand::SelectInstance(name)) => {
                let reply = match &name {
                    Some(n) => format!("selection pinned to {n}\n"),
                    None => "selection unpinned\n".into(),
                };
                self.selector.set_override(name);
                reply
            }
            Ok(ControlCommand::TestMode { id, params }) => {
                for inst in &self.instances {
                    self.send_body(ctx, inst, msg_id::TEST_MODE, Body::TestMode { id, params });
                }
                format!("test mode {id} applied\n")
            }
            Ok(ControlCommand::PidAdjust {
                kp,
                ki,
                kd,
                servo_mask,
                reset,
            }) => {
                let mut applied = 0;
                for (i, inst) in self.instances.iter().enumerate() {
                    if servo_mask & (1 << i) == 0 {
                        continue;
                    }
                    if let Some(servo) = self.servos.get_mut(&inst.name) {
                        servo.adjust_pid(kp, ki, kd, reset);
                        applied += 1;
                    }
                }
                format!("pid adjusted on {applied} servos\n")
            }
            Ok(ControlCommand::DumpTables) => {
                self.dump_tables(ctx);
                "tables dumped to log\n".into()
            }
            Err(e) => {
                log::warn!("control: {e}");
                format!("error: {e}\n")
            }
        }
    }
}

impl ThreadHandlers for Engine {
    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        persist::ensure_state_dir(&self.cfg.state_dir)?;
        self.lock = Some(LockFile::acquire(&self.cfg.lock_path)?);

        if let Some(signals) = self.signals.take() {
            ctx.watch_signals(&signals)?;
            self.signals = Some(signals);
        }

        ctx.bus().publish(ctx.name(), msg_id::RT_STATS);

        // Every link-table consumer must be subscribed before the netlink
        // thread can publish, so the committed consumer count is exact: the
        // engine subscribes here and the instance threads subscribe during
        // their startup, which spawn() waits for.
        ctx.bus().subscribe_messages(
            ctx.name(),
            msg_id::LINK_TABLE_PUBLISHED,
            ctx.mailbox().clone(),
            ctx.pools().global.clone(),
        );
        self.spawn_instances(ctx)?;

        let netlink = self.runtime.spawn(
            crate::link::engine::THREAD_NAME,
            LinkEngine::new(Arc::clone(&self.services.tables)),
            Some(ctx.mailbox().clone()),
        )?;
        self.netlink = Some(netlink);

        let sock = ControlSocket::open(&self.cfg.control_path)?;
        ctx.add_user_fd(sock.raw(), true, false)?;
        self.control_sock = Some(sock);

        ctx.create_timer(TIMER_SELECTION, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_STATS, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_SAVE_STATE, ClockDomain::Monotonic)?;
        ctx.start_timer(
            TIMER_SELECTION,
            TimerSpec::periodic(TimeSpec::from_secs_f64(self.cfg.selection_interval_s)),
        )?;
        ctx.start_timer(
            TIMER_STATS,
            TimerSpec::periodic(TimeSpec::from_secs_f64(self.cfg.stats_interval_s)),
        )?;
        ctx.start_timer(
            TIMER_SAVE_STATE,
            TimerSpec::periodic(TimeSpec::from_secs_f64(self.cfg.save_state_interval_s)),
        )?;

        persist::notify_ready();
        log::info!(
            "engine: running with {} instances, selection interval {}s",
            self.instances.len(),
            self.cfg.selection_interval_s
        );
        Ok(())
    }

    fn on_shutdown(&mut self, ctx: &mut ThreadContext, code: i32) {
        log::info!("engine: shutting down ({code})");
        self.save_states(ctx);
        for inst in self.instances.drain(..) {
            if let Err(e) = self.runtime.destroy(&inst.handle) {
                log::warn!("engine: destroying '{}': {e}", inst.name);
            }
        }
        if let Some(netlink) = self.netlink.take() {
            if let Err(e) = self.runtime.destroy(&netlink) {
                log::warn!("engine: destroying netlink thread: {e}");
            }
        }
        self.control_sock = None;
        self.lock = None;
    }

    fn on_message(&mut self, ctx: &mut ThreadContext, msg: Msg) {
        match msg.id {
            msg_id::LINK_TABLE_PUBLISHED => {
                if let Body::LinkTable { version } = msg.body {
                    if let Some(table) = self.services.tables.get(version) {
                        log::info!(
                            "engine: link table v{version} ({} rows), re-enumerating clocks",
                            table.len()
                        );
                        if let Err(e) = self.services.registry.enumerate(&table) {
                            log::error!("engine: clock enumeration failed: {e}");
                        }
                    }
                    if let Err(e) = self.services.tables.release(version) {
                        log::error!(target: "critical", "engine: link table release: {e}");
                        ctx.exit(-1);
                    }
                }
            }
            msg_id::THREAD_EXITED => {
                if let Body::ThreadExited { name, code } = &msg.body {
                    if *code == 0 {
                        log::info!("engine: thread '{name}' exited cleanly");
                    } else {
                        log::error!("engine: thread '{name}' exited with {code}");
                    }
                }
            }
            other => log::debug!("engine: unhandled message {other}"),
        }
    }

    fn on_user_fds(&mut self, ctx: &mut ThreadContext, ready: &[Readiness]) {
        let Some(fd) = self.control_sock.as_ref().map(|s| s.raw()) else {
            return;
        };
        for r in ready {
            if r.fd != fd || !r.readable {
                continue;
            }
            loop {
                let Some((line, addr, addr_len)) =
                    self.control_sock.as_ref().and_then(|s| s.recv())
                else {
                    break;
                };
                log::info!("control: '{line}'");
                let reply = self.handle_command(ctx, &line);
                if let Some(sock) = &self.control_sock {
                    sock.reply(&reply, &addr, addr_len);
                }
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut ThreadContext, id: TimerId, _expiries: u64) {
        match id {
            TIMER_SELECTION => self.tick(ctx),
            TIMER_STATS => self.emit_stats(),
            TIMER_SAVE_STATE => self.save_states(ctx),
            other => log::debug!("engine: unexpected {other}"),
        }
    }

    fn on_signal(&mut self, ctx: &mut ThreadContext, signo: i32) {
        let rt_base = unsafe { libc::SIGRTMIN() };
        match signo {
            libc::SIGINT | libc::SIGTERM => {
                log::info!("engine: signal {signo}, orderly exit");
                ctx.exit(0);
            }
            libc::SIGHUP => {
                log::info!("engine: SIGHUP, log rotation requested");
            }
            libc::SIGUSR1 => {
                log::info!("engine: SIGUSR1, stepping clocks");
                self.step_clocks_now(ctx);
            }
            s if s >= rt_base && s < rt_base + 3 => {
                let id = (s - rt_base) as u32;
                log::info!("engine: realtime signal -> test mode {id}");
                for inst in &self.instances {
                    self.send_body(
                        ctx,
                        inst,
                        msg_id::TEST_MODE,
                        Body::TestMode {
                            id,
                            params: [0; 3],
                        },
                    );
                }
            }
            other => log::debug!("engine: ignoring signal {other}"),
        }
    }
}

/// Build the full daemon and run the engine on the calling thread. Returns
/// the engine's exit code.
pub fn run_daemon(cfg: Config) -> Result<i32> {
    let signals = SignalSet::block(&daemon_signals())?;
    let bus = Arc::new(MulticastBus::new());
    let pools = PoolSet::new(
        cfg.global_pool_msgs,
        cfg.local_pool_msgs,
        cfg.rt_stats_pool_msgs,
    );
    let runtime = Runtime::new(bus, pools, cfg.zombie_policy);

    let hwlock = Arc::new(HardwareLock::new());
    let registry = Arc::new(ClockRegistry::new(hwlock));
    let tables = Arc::new(LinkTableSet::new());
    let services = ModuleServices {
        registry,
        tables,
        state_dir: std::path::PathBuf::from(&cfg.state_dir),
    };

    let mut engine = Engine::new(cfg, runtime.clone(), services, Some(signals));
    match runtime.run_root("engine", &mut engine) {
        Ok(code) => Ok(code),
        Err(e) => {
            persist::notify_error(e.errno());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(dir: &std::path::Path) -> Engine {
        let mut cfg = Config::default();
        cfg.lock_path = dir.join("lock").to_str().unwrap().into();
        cfg.state_dir = dir.join("state").to_str().unwrap().into();
        cfg.control_path = dir.join("ctl.sock").to_str().unwrap().into();
        let runtime = Runtime::new(
            Arc::new(MulticastBus::new()),
            PoolSet::new(16, 8, 8),
            cfg.zombie_policy,
        );
        let hwlock = Arc::new(HardwareLock::new());
        let services = ModuleServices {
            registry: Arc::new(ClockRegistry::new(hwlock)),
            tables: Arc::new(LinkTableSet::new()),
            state_dir: std::path::PathBuf::from(&cfg.state_dir),
        };
        Engine::new(cfg, runtime, services, None)
    }

    #[test]
    fn test_command_replies() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let mut ctx = crate::runtime::thread::test_context("engine-test");
        assert!(engine
            .handle_command(&mut ctx, "selectinstance a")
            .contains("pinned"));
        assert_eq!(engine.selector.override_name(), Some("a"));
        assert!(engine
            .handle_command(&mut ctx, "selectinstance none")
            .contains("unpinned"));
        assert!(engine.handle_command(&mut ctx, "bogus").starts_with("error"));
    }

    #[test]
    fn test_exit_command_requests_reactor_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let mut ctx = crate::runtime::thread::test_context("engine-test");
        let reply = engine.handle_command(&mut ctx, "exit");
        assert!(reply.contains("exiting"));
    }

    #[test]
    fn test_stepclocks_excludes_elected_clock_from_system_alignment() {
        use crate::clocks::{Clock, HwId};

        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let mut ctx = crate::runtime::thread::test_context("engine-test");

        // Two hardware clocks; one belongs to the elected instance.
        let elected_hwid = HwId::from_mac([0, 0x0f, 0x53, 0, 0, 1]);
        let other_hwid = HwId::from_mac([0, 0x0f, 0x53, 0, 0, 2]);
        engine
            .services
            .registry
            .insert_for_tests(Clock::fake(elected_hwid, "phc-elected"));
        engine
            .services
            .registry
            .insert_for_tests(Clock::fake(other_hwid, "phc-other"));

        // No elected instance yet: both hardware clocks are aligned.
        let reply = engine.handle_command(&mut ctx, "stepclocks");
        assert!(reply.contains("(2 aligned to system)"), "reply: {reply}");

        let mut s = SyncInstanceStatus::new("fr", ModuleKind::Freerun, 64);
        s.state = SyncState::Slave;
        s.clock = engine.services.registry.find_by_hwid(elected_hwid);
        s.offset_from_master_ns = 1500.0;
        engine.statuses = vec![s];
        engine.selector.select(&engine.statuses);
        assert_eq!(engine.selector.selected(), Some(0));

        // With an election in place the elected instance's clock stays with
        // its own reference; only the other clock goes to the system clock.
        let reply = engine.handle_command(&mut ctx, "stepclocks");
        assert!(reply.contains("(1 aligned to system)"), "reply: {reply}");
    }
}
