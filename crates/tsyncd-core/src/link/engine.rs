//! The link-state engine thread.
//!
//! Ingests kernel link events into a work-in-progress table, waits for a
//! quiescence window after each burst, and publishes a new immutable version
//! only when something a consumer cares about actually changed. Team runner
//! details are fetched lazily once the team genetlink family id is known;
//! until then affected interfaces stay queued for rescan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::link::netlink::{NetlinkSocket, NlEvent};
use crate::link::ring::LinkTableSet;
use crate::link::{Link, LinkKind, LinkTable};
use crate::message::{msg_id, Body, Msg};
use crate::runtime::event::EventId;
use crate::runtime::timer::{TimerId, TimerSpec};
use crate::runtime::{Readiness, ThreadContext, ThreadHandlers};
use crate::time::{ClockDomain, TimeSpec};

/// Thread name the engine registers under.
pub const THREAD_NAME: &str = "netlink";

const TIMER_QUIESCE: TimerId = TimerId(1);
const TIMER_FAMILY_RETRY: TimerId = TimerId(2);
const EVENT_RESERVICE: EventId = EventId(1);

/// Settle window after a burst of kernel events before publication.
const QUIESCE: TimeSpec = TimeSpec {
    sec: 0,
    nsec: 100_000_000,
};
/// Interval between generic-netlink family resolution retries.
const FAMILY_RETRY: TimeSpec = TimeSpec { sec: 1, nsec: 0 };

/// The link-state engine. Runs as its own thread under the runtime.
pub struct LinkEngine {
    ring: Arc<LinkTableSet>,
    route: Option<NetlinkSocket>,
    genl: Option<NetlinkSocket>,
    /// Work-in-progress table, keyed by interface index.
    wip: HashMap<i32, Link>,
    /// Rows of the most recently published version.
    published: Vec<Link>,
    has_published: bool,
    /// Publication attempted while the ring head was referenced.
    need_publish: bool,
    /// Interfaces awaiting an ethtool TSINFO answer or family id.
    pending_tsinfo: HashSet<i32>,
    /// Team interfaces awaiting the team family id or a re-query.
    pending_team: HashSet<i32>,
    /// Set while a needed genl family is unresolved.
    need_rescan: bool,
}

impl LinkEngine {
    pub fn new(ring: Arc<LinkTableSet>) -> Self {
        Self {
            ring,
            route: None,
            genl: None,
            wip: HashMap::new(),
            published: Vec::new(),
            has_published: false,
            need_publish: false,
            pending_tsinfo: HashSet::new(),
            pending_team: HashSet::new(),
            need_rescan: false,
        }
    }

    fn apply_newlink(&mut self, n: crate::link::netlink::LinkNotification) {
        let row = self
            .wip
            .entry(n.ifindex)
            .or_insert_with(|| Link::new(n.ifindex, &n.name));
        // Base-record update: team and ethtool fields are inherited from the
        // prior state of this row; only the kernel-reported base fields move.
        row.name = n.name;
        row.if_type = n.if_type;
        row.flags = n.flags;
        row.family = n.family;
        row.kind = n.kind;
        row.master_ifindex = n.master_ifindex;
        row.parent_ifindex = n.parent_ifindex;
        row.vlan_id = n.vlan_id;
        row.is_slave = n.slave_kind_present || n.master_ifindex != 0;
        if n.kind == LinkKind::Bond {
            row.bond_mode = n.bond_mode;
            row.active_slave_ifindex = n.active_slave_ifindex;
        }
        if n.perm_addr != [0u8; 6] {
            row.perm_addr = n.perm_addr;
        }
        self.pending_tsinfo.insert(n.ifindex);
        if n.kind == LinkKind::Team {
            self.pending_team.insert(n.ifindex);
        }
    }

    /// Issue any deferred genl queries whose family ids have arrived.
    fn flush_pending_queries(&mut self) {
        let Some(genl) = self.genl.as_mut() else {
            return;
        };
        if genl.ethtool_family().is_some() {
            for ifindex in self.pending_tsinfo.iter().copied().collect::<Vec<_>>() {
                if let Err(e) = genl.request_tsinfo(ifindex) {
                    log::debug!("tsinfo query for ifindex {ifindex} failed: {e}");
                }
            }
        }
        if genl.team_family().is_some() {
            for ifindex in self.pending_team.iter().copied().collect::<Vec<_>>() {
                if let Err(e) = genl.request_team_options(ifindex) {
                    log::debug!("team query for ifindex {ifindex} failed: {e}");
                }
            }
        }
        // The need-rescan flag clears only once every family has arrived.
        self.need_rescan =
            genl.ethtool_family().is_none() || genl.team_family().is_none();
    }

    fn handle_events(&mut self, ctx: &mut ThreadContext, events: Vec<NlEvent>) {
        let mut touched = false;
        for ev in events {
            match ev {
                NlEvent::NewLink(n) => {
                    log::trace!("netlink: newlink ifindex {} ({})", n.ifindex, n.name);
                    self.apply_newlink(n);
                    touched = true;
                }
                NlEvent::DelLink(ifindex) => {
                    log::trace!("netlink: dellink ifindex {ifindex}");
                    self.wip.remove(&ifindex);
                    self.pending_tsinfo.remove(&ifindex);
                    self.pending_team.remove(&ifindex);
                    touched = true;
                }
                NlEvent::Done => touched = true,
                NlEvent::Family { name, id } => {
                    log::info!("netlink: resolved genl family '{name}' -> {id}");
                    self.flush_pending_queries();
                }
                NlEvent::TsInfo {
                    ifindex,
                    caps,
                    phc_index,
                } => {
                    self.pending_tsinfo.remove(&ifindex);
                    if let Some(row) = self.wip.get_mut(&ifindex) {
                        row.ts_caps = caps;
                        row.phc_index = phc_index;
                        touched = true;
                    }
                }
                NlEvent::TeamInfo {
                    ifindex,
                    mode,
                    active_port_ifindex,
                } => {
                    self.pending_team.remove(&ifindex);
                    if let Some(row) = self.wip.get_mut(&ifindex) {
                        row.bond_mode = mode;
                        row.active_slave_ifindex = active_port_ifindex;
                        touched = true;
                    }
                }
                NlEvent::NlError(errno) => {
                    log::debug!("netlink: kernel error {errno}");
                }
            }
        }
        if touched {
            if let Err(e) = ctx.start_timer(TIMER_QUIESCE, TimerSpec::oneshot(QUIESCE)) {
                log::error!("netlink: quiescence timer: {e}");
            }
        }
    }

    /// Compare the work-in-progress table against the last published version
    /// and publish if anything significant changed.
    fn try_publish(&mut self, ctx: &mut ThreadContext) {
        let rows: Vec<Link> = self.wip.values().cloned().collect();
        let candidate = LinkTable::new(0, rows.clone());
        if self.has_published {
            let prev = LinkTable::new(0, self.published.clone());
            if candidate.diff(&prev).is_empty() {
                log::trace!("netlink: no significant change, discarding working table");
                self.need_publish = false;
                return;
            }
        }
        let consumers = ctx.bus().subscriber_count(msg_id::LINK_TABLE_PUBLISHED);
        match self.ring.publish(rows.clone(), consumers) {
            Ok(version) => {
                log::info!(
                    "netlink: published link table v{version} ({} rows, {consumers} consumers)",
                    rows.len()
                );
                self.published = rows;
                self.has_published = true;
                self.need_publish = false;
                if let Err(e) =
                    ctx.bus()
                        .send(msg_id::LINK_TABLE_PUBLISHED, &Body::LinkTable { version }, false)
                {
                    log::warn!("netlink: link table notify failed: {e}");
                }
            }
            Err(Error::TryAgain(_)) => {
                // Re-serviced when a consumer release frees the ring head.
                self.need_publish = true;
            }
            Err(e) => {
                log::error!(target: "critical", "netlink: publish failed: {e}");
                ctx.exit(-1);
            }
        }
    }

    fn full_rescan(&mut self) -> Result<()> {
        if let Some(route) = self.route.as_mut() {
            route.request_link_dump()?;
        }
        Ok(())
    }
}

impl ThreadHandlers for LinkEngine {
    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        let mut route = NetlinkSocket::open_route()?;
        let mut genl = NetlinkSocket::open_generic()?;

        ctx.add_user_fd(route.raw(), true, false)?;
        ctx.add_user_fd(genl.raw(), true, false)?;
        ctx.create_timer(TIMER_QUIESCE, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_FAMILY_RETRY, ClockDomain::Monotonic)?;
        ctx.start_timer(TIMER_FAMILY_RETRY, TimerSpec::periodic(FAMILY_RETRY))?;

        let writer = ctx.create_event(EVENT_RESERVICE)?;
        self.ring.set_release_notify(writer);

        ctx.bus().publish(ctx.name(), msg_id::LINK_TABLE_PUBLISHED);

        genl.request_family(crate::link::netlink::TEAM_GENL_NAME)?;
        genl.request_family(crate::link::netlink::ETHTOOL_GENL_NAME)?;
        route.request_link_dump()?;
        self.need_rescan = true;

        self.route = Some(route);
        self.genl = Some(genl);
        Ok(())
    }

    fn on_shutdown(&mut self, _ctx: &mut ThreadContext, code: i32) {
        log::debug!("netlink: shutting down ({code})");
    }

    fn on_message(&mut self, _ctx: &mut ThreadContext, msg: Msg) {
        log::debug!("netlink: unexpected message {}", msg.id);
    }

    fn on_user_fds(&mut self, ctx: &mut ThreadContext, ready: &[Readiness]) {
        for r in ready {
            if !r.readable && !r.error {
                continue;
            }
            let is_route = self.route.as_ref().is_some_and(|s| s.raw() == r.fd);
            let sock = if is_route {
                self.route.as_mut()
            } else if self.genl.as_ref().is_some_and(|s| s.raw() == r.fd) {
                self.genl.as_mut()
            } else {
                None
            };
            let Some(sock) = sock else { continue };
            match sock.recv_events() {
                Ok(events) => self.handle_events(ctx, events),
                Err(Error::Overflow) => {
                    log::warn!("netlink: event buffer overrun, issuing full re-dump");
                    if let Err(e) = self.full_rescan() {
                        log::error!("netlink: re-dump failed: {e}");
                    }
                }
                Err(e) => {
                    log::error!(target: "critical", "netlink: receive failed: {e}");
                    ctx.exit(-1);
                }
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut ThreadContext, id: TimerId, _expiries: u64) {
        match id {
            TIMER_QUIESCE => self.try_publish(ctx),
            TIMER_FAMILY_RETRY => {
                if self.need_rescan {
                    if let Some(genl) = self.genl.as_mut() {
                        if genl.team_family().is_none() {
                            let _ = genl.request_family(crate::link::netlink::TEAM_GENL_NAME);
                        }
                        if genl.ethtool_family().is_none() {
                            let _ =
                                genl.request_family(crate::link::netlink::ETHTOOL_GENL_NAME);
                        }
                    }
                    self.flush_pending_queries();
                } else {
                    let _ = ctx.stop_timer(TIMER_FAMILY_RETRY);
                }
            }
            other => log::debug!("netlink: unexpected {other}"),
        }
    }

    fn on_event(&mut self, ctx: &mut ThreadContext, id: EventId) {
        if id == EVENT_RESERVICE && self.need_publish {
            self.try_publish(ctx);
        }
    }
}
