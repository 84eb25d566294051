//! Sync modules: the plurality of time references.
//!
//! Every configured instance runs one module — PTP, PPS, freerun or the NTP
//! helper — in its own thread. All modules answer the same contract
//! ([`SyncModule`]) and report the same status surface ([`status`]); the
//! engine polls them each selection tick and arbitrates with the selector.

pub mod freerun;
pub mod ntp;
pub mod pps;
pub mod ptp;
pub mod status;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clocks::ClockRegistry;
use crate::error::Result;
use crate::link::{LinkTable, LinkTableSet};
use crate::message::{msg_id, Body, Msg};
use crate::runtime::timer::TimerId;
use crate::runtime::{Readiness, ThreadContext, ThreadHandlers};
use crate::time::TimeSpec;

pub use status::{Alarm, ControlFlags, GrandmasterInfo, SyncInstanceStatus, SyncState};

/// Shared collaborators handed to every module.
#[derive(Clone)]
pub struct ModuleServices {
    pub registry: Arc<ClockRegistry>,
    pub tables: Arc<LinkTableSet>,
    pub state_dir: PathBuf,
}

/// The contract every sync module implements. Called only from the instance's
/// own thread; no method may block indefinitely.
pub trait SyncModule: Send {
    fn name(&self) -> &str;

    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()>;

    fn on_shutdown(&mut self, _ctx: &mut ThreadContext) {}

    /// Apply control flags: bits in `mask` take the value given in `flags`.
    fn control(&mut self, mask: ControlFlags, flags: ControlFlags);

    fn status(&self) -> SyncInstanceStatus;

    /// Step the module's clock by a signed offset.
    fn step_clock(&mut self, offset: TimeSpec) -> Result<()>;

    /// The engine distributes the elected instance's grandmaster so every
    /// secondary reports a consistent view downstream.
    fn update_grandmaster(&mut self, info: &GrandmasterInfo);

    fn update_leap(&mut self, leap59: bool, leap61: bool);

    /// Write the freeform persistent-state record.
    fn save_state(&self, w: &mut dyn Write) -> std::io::Result<()>;

    /// Write a topology description for diagnostics.
    fn write_topology(&self, w: &mut dyn Write) -> std::io::Result<()>;

    /// Fault-injection toggle; modules without test hooks ignore it.
    fn test_mode(&mut self, _id: u32, _params: [i64; 3]) {}

    /// Whether this module consumes link-table versions.
    fn wants_link_tables(&self) -> bool {
        false
    }

    /// A new link-table version, already resolved. The harness releases the
    /// version after this returns.
    fn on_link_table(&mut self, _ctx: &mut ThreadContext, _table: &LinkTable) {}

    fn on_timer(&mut self, _ctx: &mut ThreadContext, _id: TimerId, _expiries: u64) {}

    fn on_user_fds(&mut self, _ctx: &mut ThreadContext, _ready: &[Readiness]) {}
}

/// Thread harness wrapping a module: routes runtime callbacks and engine
/// messages onto the [`SyncModule`] contract.
pub struct InstanceThread<M: SyncModule> {
    module: M,
    services: ModuleServices,
}

impl<M: SyncModule> InstanceThread<M> {
    pub fn new(module: M, services: ModuleServices) -> Self {
        Self { module, services }
    }

    fn state_file_path(&self) -> PathBuf {
        self.services
            .state_dir
            .join(format!("state-{}", self.module.name()))
    }

    fn do_save_state(&self) {
        let path = self.state_file_path();
        let result = std::fs::File::create(&path).and_then(|mut f| {
            self.module.save_state(&mut f)?;
            writeln!(f, "last_update: {}", TimeSpec::now(crate::time::ClockDomain::Realtime))
        });
        if let Err(e) = result {
            log::warn!("{}: state file {}: {e}", self.module.name(), path.display());
        }
    }
}

impl<M: SyncModule> ThreadHandlers for InstanceThread<M> {
    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        if self.module.wants_link_tables() {
            ctx.bus().subscribe_messages(
                ctx.name(),
                msg_id::LINK_TABLE_PUBLISHED,
                ctx.mailbox().clone(),
                ctx.pools().global.clone(),
            );
        }
        self.module.on_startup(ctx)
    }

    fn on_shutdown(&mut self, ctx: &mut ThreadContext, code: i32) {
        log::debug!("{}: shutting down ({code})", self.module.name());
        self.module.on_shutdown(ctx);
    }

    fn on_message(&mut self, ctx: &mut ThreadContext, msg: Msg) {
        match msg.id {
            msg_id::STATUS_GET => {
                let status = self.module.status();
                let rep = msg.into_reply(msg_id::STATUS_REPLY, Body::Status(Box::new(status)));
                ctx.reply(rep);
            }
            msg_id::CONTROL => {
                if let Body::Control { mask, flags } = msg.body {
                    self.module.control(mask, flags);
                }
            }
            msg_id::STEP_CLOCK => {
                if let Body::StepClock { offset } = msg.body {
                    if let Err(e) = self.module.step_clock(offset) {
                        log::warn!("{}: step failed: {e}", self.module.name());
                    }
                }
            }
            msg_id::GRANDMASTER_UPDATE => {
                if let Body::Grandmaster(info) = &msg.body {
                    self.module.update_grandmaster(info);
                }
            }
            msg_id::LEAP_UPDATE => {
                if let Body::Leap { leap59, leap61 } = msg.body {
                    self.module.update_leap(leap59, leap61);
                }
            }
            msg_id::SAVE_STATE => self.do_save_state(),
            msg_id::TEST_MODE => {
                if let Body::TestMode { id, params } = msg.body {
                    self.module.test_mode(id, params);
                }
            }
            msg_id::WRITE_TOPOLOGY => {
                let mut buf = Vec::new();
                if self.module.write_topology(&mut buf).is_ok() {
                    log::info!(
                        "{} topology:\n{}",
                        self.module.name(),
                        String::from_utf8_lossy(&buf)
                    );
                }
            }
            msg_id::LINK_TABLE_PUBLISHED => {
                if let Body::LinkTable { version } = msg.body {
                    if let Some(table) = self.services.tables.get(version) {
                        self.module.on_link_table(ctx, &table);
                    }
                    // Exactly one release per consumer per version.
                    if let Err(e) = self.services.tables.release(version) {
                        log::error!(
                            target: "critical",
                            "{}: link table release: {e}",
                            self.module.name()
                        );
                        ctx.exit(-1);
                    }
                }
            }
            other => {
                log::debug!("{}: unhandled message {other}", self.module.name());
            }
        }
    }

    fn on_user_fds(&mut self, ctx: &mut ThreadContext, ready: &[Readiness]) {
        self.module.on_user_fds(ctx, ready);
    }

    fn on_timer(&mut self, ctx: &mut ThreadContext, id: TimerId, expiries: u64) {
        self.module.on_timer(ctx, id, expiries);
    }
}

/// Write the standard saved-state preamble shared by all modules.
pub(crate) fn write_state_header(
    w: &mut dyn Write,
    status: &SyncInstanceStatus,
) -> std::io::Result<()> {
    writeln!(w, "instance: {}", status.name)?;
    match &status.clock {
        Some(clock) => writeln!(w, "clock-name: {}", clock.long_name())
            .and_then(|()| writeln!(w, "clock-id: {}", clock.hwid()))?,
        None => writeln!(w, "clock-name: none")?,
    }
    writeln!(w, "state: {}", status.state)?;
    writeln!(w, "alarms: {}", status.alarms)?;
    writeln!(w, "control-flags: {}", status.control)?;
    Ok(())
}
