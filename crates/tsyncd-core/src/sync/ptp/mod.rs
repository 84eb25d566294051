//! PTP sync module: IEEE 1588 ordinary/boundary clock port.
//!
//! The port state machine is driven by qualified foreign-master announces,
//! BMCA outcomes, receipt timeouts, fault conditions and administrative
//! control flags. Timing flows (SYNC/FOLLOW_UP, DELAY_REQ/RESP, PDELAY)
//! correlate hardware timestamps from the socket layer into offset and
//! path-delay measurements surfaced through the instance status.

pub mod bmc;
pub mod socket;
pub mod wire;

use std::io::Write;
use std::sync::Arc;

use serde::Deserialize;

use crate::clocks::Clock;
use crate::config::{InstanceConfig, ModuleKind, PtpConfig};
use crate::error::{Error, Result};
use crate::link::LinkTable;
use crate::runtime::timer::{TimerId, TimerSpec};
use crate::runtime::{Readiness, ThreadContext};
use crate::sync::status::{
    Alarm, ControlFlags, GrandmasterInfo, SyncInstanceStatus, SyncState,
};
use crate::sync::{write_state_header, ModuleServices, SyncModule};
use crate::time::{ClockDomain, TimeSpec};

use bmc::ForeignMasterSet;
use socket::{BondBypass, PtpSocket, RxFrame, TxTimestampTracker};
use wire::{
    accuracy_to_ns, ns_to_accuracy, AnnounceBody, ClockQuality, MessageType, PortIdentity,
    PtpBody, PtpHeader, PtpMessage, WireTimestamp, FLAG_FREQ_TRACEABLE, FLAG_LEAP59,
    FLAG_LEAP61, FLAG_TIME_TRACEABLE, FLAG_TWO_STEP, PTP_PRIMARY_MCAST,
};

const TIMER_ANNOUNCE_TIMEOUT: TimerId = TimerId(1);
const TIMER_ANNOUNCE_TX: TimerId = TimerId(2);
const TIMER_SYNC_TX: TimerId = TimerId(3);
const TIMER_DELAY_REQ: TimerId = TimerId(4);
const TIMER_WATCHDOG: TimerId = TimerId(5);

const WATCHDOG_INTERVAL: TimeSpec = TimeSpec { sec: 1, nsec: 0 };

/// Supported delay measurement mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMechanism {
    E2e,
    P2p,
}

/// Profile selection, indexing a descriptor of acceptable capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PtpProfile {
    #[default]
    DefaultE2e,
    DefaultP2p,
    Enterprise,
}

/// What a profile permits and how it measures delay.
#[derive(Debug, Clone, Copy)]
pub struct ProfileDescriptor {
    pub delay_mechanism: DelayMechanism,
    pub multicast_only: bool,
    pub unicast_capable: bool,
}

impl PtpProfile {
    pub fn descriptor(self) -> ProfileDescriptor {
        match self {
            Self::DefaultE2e => ProfileDescriptor {
                delay_mechanism: DelayMechanism::E2e,
                multicast_only: true,
                unicast_capable: false,
            },
            Self::DefaultP2p => ProfileDescriptor {
                delay_mechanism: DelayMechanism::P2p,
                multicast_only: true,
                unicast_capable: false,
            },
            Self::Enterprise => ProfileDescriptor {
                delay_mechanism: DelayMechanism::E2e,
                multicast_only: false,
                unicast_capable: true,
            },
        }
    }
}

/// Port states of the IEEE 1588 machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
    Faulty,
    Disabled,
}

impl PortState {
    pub fn to_sync_state(self) -> SyncState {
        match self {
            Self::Initializing | Self::Listening | Self::Uncalibrated => SyncState::Listening,
            Self::PreMaster | Self::Master => SyncState::Master,
            Self::Passive => SyncState::Passive,
            Self::Slave => SyncState::Slave,
            Self::Faulty => SyncState::Faulty,
            Self::Disabled => SyncState::Disabled,
        }
    }
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::Listening => "LISTENING",
            Self::PreMaster => "PRE_MASTER",
            Self::Master => "MASTER",
            Self::Passive => "PASSIVE",
            Self::Uncalibrated => "UNCALIBRATED",
            Self::Slave => "SLAVE",
            Self::Faulty => "FAULTY",
            Self::Disabled => "DISABLED",
        };
        write!(f, "{s}")
    }
}

/// Fault-injection test modes toggled through the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    #[default]
    None,
    /// Perturb receive timestamps by a pseudo-random jitter.
    TimestampJitter,
    /// Pretend the NIC stops delivering transmit timestamps.
    EmulateNoTxTimestamps,
}

/// A two-step sync waiting for its follow-up.
#[derive(Debug, Clone, Copy)]
struct PendingSync {
    sequence_id: u16,
    rx_timestamp: TimeSpec,
    correction_ns: f64,
}

/// An in-flight delay request: sent, waiting for t3 and the response.
#[derive(Debug, Clone, Copy, Default)]
struct DelayExchange {
    sequence_id: u16,
    t3: Option<TimeSpec>,
    t4: Option<TimeSpec>,
    /// Peer turnaround for P2P: t3' - t2'.
    peer_turnaround_ns: Option<f64>,
}

/// Receive-side freshness tracking for the alarm watchdog.
#[derive(Debug, Clone, Copy, Default)]
struct RxAges {
    sync: Option<TimeSpec>,
    follow_up: Option<TimeSpec>,
    delay_resp: Option<TimeSpec>,
    pdelay_resp: Option<TimeSpec>,
    pdelay_resp_follow_up: Option<TimeSpec>,
}

pub struct PtpModule {
    cfg: InstanceConfig,
    ptp: PtpConfig,
    services: ModuleServices,
    profile: ProfileDescriptor,

    state: PortState,
    port_identity: PortIdentity,
    ifindex: i32,
    socket: Option<PtpSocket>,
    bypass: Option<BondBypass>,
    clock: Option<Arc<Clock>>,

    foreign: ForeignMasterSet,
    parent: Option<(PortIdentity, AnnounceBody)>,
    tx_tracker: TxTimestampTracker,

    announce_seq: u16,
    sync_seq: u16,
    delay_req_seq: u16,

    pending_sync: Option<PendingSync>,
    /// Last completed (t1, t2) pair, ns scale differences folded in.
    last_sync_pair: Option<(TimeSpec, TimeSpec)>,
    delay_exchange: Option<DelayExchange>,
    mean_path_delay_ns: f64,
    offset_ns: f64,
    last_measurement: Option<TimeSpec>,

    rx_ages: RxAges,
    alarms: Alarm,
    control: ControlFlags,
    leap59: bool,
    leap61: bool,
    /// Set when the leap guard clears: processing resumes at the next
    /// announce, not before.
    resume_after_announce: bool,
    gm_override: Option<GrandmasterInfo>,
    test_mode: TestMode,
    hw_ts: bool,
    missing_rx_timestamps: u32,
}

impl PtpModule {
    pub fn new(cfg: InstanceConfig, services: ModuleServices) -> Self {
        let ptp = cfg.ptp.clone();
        let profile = ptp.profile.descriptor();
        Self {
            foreign: ForeignMasterSet::new(ptp.foreign_record_cap),
            tx_tracker: TxTimestampTracker::new(TimeSpec::from_secs_f64(ptp.timestamp_window_s)),
            cfg,
            ptp,
            services,
            profile,
            state: PortState::Initializing,
            port_identity: PortIdentity::default(),
            ifindex: 0,
            socket: None,
            bypass: None,
            clock: None,
            parent: None,
            announce_seq: 0,
            sync_seq: 0,
            delay_req_seq: 0,
            pending_sync: None,
            last_sync_pair: None,
            delay_exchange: None,
            mean_path_delay_ns: 0.0,
            offset_ns: 0.0,
            last_measurement: None,
            rx_ages: RxAges::default(),
            alarms: Alarm::empty(),
            control: ControlFlags::TIMESTAMP_PROCESSING,
            leap59: false,
            leap61: false,
            resume_after_announce: false,
            gm_override: None,
            test_mode: TestMode::None,
            hw_ts: false,
            missing_rx_timestamps: 0,
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn set_test_mode(&mut self, mode: TestMode) {
        log::info!("ptp {}: test mode {mode:?}", self.cfg.name);
        self.test_mode = mode;
    }

    fn set_state(&mut self, next: PortState) {
        if self.state != next {
            log::info!("ptp {}: {} -> {next}", self.cfg.name, self.state);
            self.state = next;
        }
    }

    fn announce_interval(&self) -> TimeSpec {
        TimeSpec::from_secs_f64(2f64.powi(self.ptp.log_announce_interval as i32))
    }

    fn announce_timeout(&self) -> TimeSpec {
        let ival = self.announce_interval();
        TimeSpec::from_ns(ival.as_ns() * self.ptp.announce_receipt_timeout as i64)
    }

    fn sync_interval(&self) -> TimeSpec {
        TimeSpec::from_secs_f64(2f64.powi(self.ptp.log_sync_interval as i32))
    }

    fn delay_req_interval(&self) -> TimeSpec {
        TimeSpec::from_secs_f64(2f64.powi(self.ptp.log_delay_req_interval as i32))
    }

    /// The announce dataset this port would advertise as master.
    fn own_announce(&self) -> AnnounceBody {
        if let Some(gm) = &self.gm_override {
            return AnnounceBody {
                gm_priority1: 128,
                gm_quality: ClockQuality {
                    class: gm.clock_class,
                    accuracy: ns_to_accuracy(gm.accuracy_ns),
                    variance: gm.variance,
                },
                gm_priority2: 128,
                gm_identity: gm.clock_id.0,
                steps_removed: gm.steps_removed.saturating_add(1),
                time_source: gm.time_source,
                ..Default::default()
            };
        }
        let (class, accuracy) = match &self.clock {
            Some(c) => (
                match c.class() {
                    crate::clocks::ClockClass::Locked => 6,
                    crate::clocks::ClockClass::Holdover => 7,
                    crate::clocks::ClockClass::Freerunning => 248,
                },
                c.accuracy_ns().unwrap_or(f64::INFINITY),
            ),
            None => (248, f64::INFINITY),
        };
        AnnounceBody {
            gm_priority1: 128,
            gm_quality: ClockQuality {
                class,
                accuracy: ns_to_accuracy(accuracy),
                variance: 0xffff,
            },
            gm_priority2: 128,
            gm_identity: self.port_identity.clock_id,
            steps_removed: 0,
            time_source: 0xa0,
            ..Default::default()
        }
    }

    /// Run the best-master-clock decision against the foreign set.
    fn run_bmca(&mut self, ctx: &mut ThreadContext) {
        if matches!(self.state, PortState::Disabled | PortState::Faulty) {
            return;
        }
        let own = self.own_announce();
        let best = self.foreign.best().map(|r| (r.port_identity, r.announce));
        match best {
            Some((sender, announce))
                if bmc::compare_datasets(&announce, &sender, &own, &self.port_identity)
                    == std::cmp::Ordering::Less =>
            {
                let parent_changed = self
                    .parent
                    .as_ref()
                    .map_or(true, |(p, _)| *p != sender);
                self.parent = Some((sender, announce));
                if parent_changed {
                    log::info!(
                        "ptp {}: new parent {sender}, grandmaster {:02x?}",
                        self.cfg.name,
                        announce.gm_identity
                    );
                    self.pending_sync = None;
                    self.last_sync_pair = None;
                    self.delay_exchange = None;
                    self.set_state(PortState::Uncalibrated);
                    self.start_slave_timers(ctx);
                } else if self.state == PortState::Listening
                    || self.state == PortState::Master
                    || self.state == PortState::PreMaster
                {
                    self.set_state(PortState::Uncalibrated);
                    self.start_slave_timers(ctx);
                }
                self.restart_announce_timeout(ctx);
            }
            _ => {
                // No better master on the wire: this port takes over.
                self.parent = None;
                if !matches!(self.state, PortState::Master | PortState::PreMaster) {
                    self.set_state(PortState::PreMaster);
                    self.start_master_timers(ctx);
                }
            }
        }
    }

    fn restart_announce_timeout(&mut self, ctx: &mut ThreadContext) {
        if let Err(e) =
            ctx.start_timer(TIMER_ANNOUNCE_TIMEOUT, TimerSpec::oneshot(self.announce_timeout()))
        {
            log::warn!("ptp {}: announce timeout timer: {e}", self.cfg.name);
        }
    }

    fn start_master_timers(&mut self, ctx: &mut ThreadContext) {
        let _ = ctx.start_timer(TIMER_ANNOUNCE_TX, TimerSpec::periodic(self.announce_interval()));
        let _ = ctx.start_timer(TIMER_SYNC_TX, TimerSpec::periodic(self.sync_interval()));
        let _ = ctx.stop_timer(TIMER_DELAY_REQ);
    }

    fn start_slave_timers(&mut self, ctx: &mut ThreadContext) {
        let _ = ctx.stop_timer(TIMER_ANNOUNCE_TX);
        let _ = ctx.stop_timer(TIMER_SYNC_TX);
        let _ =
            ctx.start_timer(TIMER_DELAY_REQ, TimerSpec::periodic(self.delay_req_interval()));
    }

    fn header(&self, message_type: MessageType) -> PtpHeader {
        let mut h = PtpHeader::new(message_type, self.ptp.domain, self.port_identity);
        if self.leap59 {
            h.flags |= FLAG_LEAP59;
        }
        if self.leap61 {
            h.flags |= FLAG_LEAP61;
        }
        h
    }

    fn transmit(&mut self, msg: &PtpMessage) -> Result<()> {
        let bytes = msg.encode();
        let dest = match msg.header.message_type {
            MessageType::PdelayReq
            | MessageType::PdelayResp
            | MessageType::PdelayRespFollowUp => wire::PTP_PDELAY_MCAST,
            _ => PTP_PRIMARY_MCAST,
        };
        let socket = self
            .socket
            .as_ref()
            .ok_or(Error::Protocol("no socket".into()))?;
        match socket.send_to(&bytes, dest) {
            Ok(()) => {
                if msg.header.message_type.is_event() && !self.emulating_no_tx_ts() {
                    self.tx_tracker.expect(
                        msg.header.message_type,
                        msg.header.sequence_id,
                        TimeSpec::now(ClockDomain::Monotonic),
                    );
                }
                Ok(())
            }
            Err(Error::WouldBlock) => Err(Error::WouldBlock),
            Err(e) => {
                log::error!("ptp {}: send failed: {e}", self.cfg.name);
                self.set_state(PortState::Faulty);
                Err(e)
            }
        }
    }

    fn emulating_no_tx_ts(&self) -> bool {
        self.test_mode == TestMode::EmulateNoTxTimestamps
    }

    fn send_announce(&mut self) {
        let mut header = self.header(MessageType::Announce);
        self.announce_seq = self.announce_seq.wrapping_add(1);
        header.sequence_id = self.announce_seq;
        header.log_interval = self.ptp.log_announce_interval;
        let gm = self.own_announce();
        if gm.time_source == 0x20 {
            header.flags |= FLAG_TIME_TRACEABLE | FLAG_FREQ_TRACEABLE;
        }
        let msg = PtpMessage::new(header, PtpBody::Announce(gm));
        let _ = self.transmit(&msg);
    }

    fn send_sync(&mut self) {
        let mut header = self.header(MessageType::Sync);
        self.sync_seq = self.sync_seq.wrapping_add(1);
        header.sequence_id = self.sync_seq;
        header.flags |= FLAG_TWO_STEP;
        header.log_interval = self.ptp.log_sync_interval;
        let now = self
            .clock
            .as_ref()
            .and_then(|c| c.read_time().ok())
            .unwrap_or_else(|| TimeSpec::now(ClockDomain::Realtime));
        let origin = WireTimestamp::from_timespec(now).unwrap_or_default();
        let msg = PtpMessage::new(header, PtpBody::Sync(origin));
        // The follow-up goes out once the transmit timestamp is reaped.
        let _ = self.transmit(&msg);
    }

    fn send_follow_up(&mut self, sequence_id: u16, precise: TimeSpec) {
        let mut header = self.header(MessageType::FollowUp);
        header.sequence_id = sequence_id;
        let Ok(origin) = WireTimestamp::from_timespec(precise) else {
            return;
        };
        let msg = PtpMessage::new(header, PtpBody::FollowUp(origin));
        let _ = self.transmit(&msg);
    }

    fn send_delay_req(&mut self) {
        let mut header = self.header(match self.profile.delay_mechanism {
            DelayMechanism::E2e => MessageType::DelayReq,
            DelayMechanism::P2p => MessageType::PdelayReq,
        });
        self.delay_req_seq = self.delay_req_seq.wrapping_add(1);
        header.sequence_id = self.delay_req_seq;
        header.log_interval = self.ptp.log_delay_req_interval;
        let body = match self.profile.delay_mechanism {
            DelayMechanism::E2e => PtpBody::DelayReq(WireTimestamp::default()),
            DelayMechanism::P2p => PtpBody::PdelayReq(WireTimestamp::default()),
        };
        let msg = PtpMessage::new(header, body);
        if self.transmit(&msg).is_ok() {
            self.delay_exchange = Some(DelayExchange {
                sequence_id: self.delay_req_seq,
                ..Default::default()
            });
        }
    }

    /// Timestamp processing gate: leap guard defers everything, and after
    /// the guard clears only an announce reopens the gate.
    fn timestamps_gated(&self) -> bool {
        self.control.contains(ControlFlags::LEAP_SECOND_GUARD) || self.resume_after_announce
    }

    /// Ingest one decoded message with its receive timestamp. Factored apart
    /// from the socket so the machine can be driven directly in tests.
    fn process_message(&mut self, ctx: &mut ThreadContext, msg: PtpMessage, rx_ts: Option<TimeSpec>) {
        if msg.header.domain != self.ptp.domain {
            return;
        }
        if msg.header.source_port == self.port_identity {
            return;
        }
        let now = TimeSpec::now(ClockDomain::Monotonic);
        match (&msg.body, msg.header.message_type) {
            (PtpBody::Announce(announce), _) => {
                if self.resume_after_announce {
                    log::info!("ptp {}: leap guard cleared, resuming", self.cfg.name);
                    self.resume_after_announce = false;
                }
                self.leap59 = msg.header.flags & FLAG_LEAP59 != 0;
                self.leap61 = msg.header.flags & FLAG_LEAP61 != 0;
                self.foreign.ingest(
                    msg.header.source_port,
                    *announce,
                    now,
                    self.announce_timeout(),
                );
                self.run_bmca(ctx);
            }
            (PtpBody::Sync(origin), _) => {
                if self.timestamps_gated() || !self.is_parent(&msg.header.source_port) {
                    return;
                }
                self.rx_ages.sync = Some(now);
                let Some(mut t2) = rx_ts else {
                    self.note_missing_rx_ts();
                    return;
                };
                if self.test_mode == TestMode::TimestampJitter {
                    // Deterministic per-sequence perturbation in +-500ns.
                    let jitter =
                        (msg.header.sequence_id as i64).wrapping_mul(2_654_435_761) % 1000 - 500;
                    t2 += TimeSpec::from_ns(jitter);
                }
                if msg.header.flags & FLAG_TWO_STEP != 0 {
                    self.pending_sync = Some(PendingSync {
                        sequence_id: msg.header.sequence_id,
                        rx_timestamp: t2,
                        correction_ns: msg.header.correction_ns(),
                    });
                } else {
                    let t1 = origin.to_timespec()
                        + TimeSpec::from_ns(msg.header.correction_ns() as i64);
                    self.complete_sync(t1, t2);
                }
            }
            (PtpBody::FollowUp(precise), _) => {
                if self.timestamps_gated() || !self.is_parent(&msg.header.source_port) {
                    return;
                }
                self.rx_ages.follow_up = Some(now);
                let Some(pending) = self.pending_sync else {
                    return;
                };
                if pending.sequence_id != msg.header.sequence_id {
                    return;
                }
                self.pending_sync = None;
                let t1 = precise.to_timespec()
                    + TimeSpec::from_ns(
                        (pending.correction_ns + msg.header.correction_ns()) as i64,
                    );
                self.complete_sync(t1, pending.rx_timestamp);
            }
            (PtpBody::DelayReq(_), _) => {
                // Master side: answer with our hardware receive timestamp.
                if matches!(self.state, PortState::Master) {
                    let Some(t4) = rx_ts else {
                        self.note_missing_rx_ts();
                        return;
                    };
                    let mut header = self.header(MessageType::DelayResp);
                    header.sequence_id = msg.header.sequence_id;
                    let Ok(receive) = WireTimestamp::from_timespec(t4) else {
                        return;
                    };
                    let resp = PtpMessage::new(
                        header,
                        PtpBody::DelayResp {
                            receive,
                            requestor: msg.header.source_port,
                        },
                    );
                    let _ = self.transmit(&resp);
                }
            }
            (PtpBody::DelayResp { receive, requestor }, _) => {
                if self.timestamps_gated() || *requestor != self.port_identity {
                    return;
                }
                self.rx_ages.delay_resp = Some(now);
                let Some(mut ex) = self.delay_exchange else {
                    return;
                };
                if ex.sequence_id != msg.header.sequence_id {
                    return;
                }
                ex.t4 = Some(receive.to_timespec());
                self.delay_exchange = Some(ex);
                self.try_complete_delay();
            }
            (PtpBody::PdelayReq(_), _) => {
                let Some(t2p) = rx_ts else {
                    self.note_missing_rx_ts();
                    return;
                };
                let mut header = self.header(MessageType::PdelayResp);
                header.sequence_id = msg.header.sequence_id;
                header.flags |= FLAG_TWO_STEP;
                let Ok(request_receipt) = WireTimestamp::from_timespec(t2p) else {
                    return;
                };
                let resp = PtpMessage::new(
                    header,
                    PtpBody::PdelayResp {
                        request_receipt,
                        requestor: msg.header.source_port,
                    },
                );
                let _ = self.transmit(&resp);
            }
            (
                PtpBody::PdelayResp {
                    request_receipt,
                    requestor,
                },
                _,
            ) => {
                if self.timestamps_gated() || *requestor != self.port_identity {
                    return;
                }
                self.rx_ages.pdelay_resp = Some(now);
                let Some(mut ex) = self.delay_exchange else {
                    return;
                };
                if ex.sequence_id != msg.header.sequence_id {
                    return;
                }
                // t4 is our receive timestamp of the response; the peer's
                // t2' arrives here, t3' in the follow-up.
                let Some(t4) = rx_ts else {
                    self.note_missing_rx_ts();
                    return;
                };
                ex.t4 = Some(t4);
                ex.peer_turnaround_ns = Some(-(request_receipt.to_timespec().as_ns() as f64));
                self.delay_exchange = Some(ex);
            }
            (
                PtpBody::PdelayRespFollowUp {
                    response_origin,
                    requestor,
                },
                _,
            ) => {
                if self.timestamps_gated() || *requestor != self.port_identity {
                    return;
                }
                self.rx_ages.pdelay_resp_follow_up = Some(now);
                let Some(mut ex) = self.delay_exchange else {
                    return;
                };
                if ex.sequence_id != msg.header.sequence_id {
                    return;
                }
                if let Some(partial) = ex.peer_turnaround_ns {
                    // partial held -t2'; add t3' to finish the turnaround.
                    ex.peer_turnaround_ns =
                        Some(partial + response_origin.to_timespec().as_ns() as f64);
                }
                self.delay_exchange = Some(ex);
                self.try_complete_delay();
            }
            (PtpBody::Signaling { .. }, _) | (PtpBody::Management { .. }, _) => {
                for tlv in &msg.tlvs {
                    if let Some((subtype, _)) = tlv.as_vendor() {
                        log::debug!(
                            "ptp {}: vendor TLV subtype {subtype:02x?} from {}",
                            self.cfg.name,
                            msg.header.source_port
                        );
                    }
                }
            }
        }
    }

    fn is_parent(&self, sender: &PortIdentity) -> bool {
        self.parent.as_ref().is_some_and(|(p, _)| p == sender)
    }

    fn note_missing_rx_ts(&mut self) {
        self.missing_rx_timestamps += 1;
    }

    /// A completed (t1, t2) sync pair: update the offset measurement.
    fn complete_sync(&mut self, t1: TimeSpec, t2: TimeSpec) {
        self.last_sync_pair = Some((t1, t2));
        let raw = (t2 - t1).as_ns() as f64;
        self.offset_ns = raw - self.mean_path_delay_ns;
        self.last_measurement = Some(TimeSpec::now(ClockDomain::Monotonic));
        if self.state == PortState::Uncalibrated {
            self.set_state(PortState::Slave);
        }
        log::trace!(
            "ptp {}: offset {:.1}ns (mpd {:.1}ns)",
            self.cfg.name,
            self.offset_ns,
            self.mean_path_delay_ns
        );
    }

    /// Try to finish the delay exchange once all four timestamps exist.
    fn try_complete_delay(&mut self) {
        let Some(ex) = self.delay_exchange else {
            return;
        };
        let (Some(t3), Some(t4)) = (ex.t3, ex.t4) else {
            return;
        };
        let mpd = match self.profile.delay_mechanism {
            DelayMechanism::E2e => {
                let Some((t1, t2)) = self.last_sync_pair else {
                    return;
                };
                // mpd = ((t2 - t1) + (t4 - t3)) / 2
                (((t2 - t1) + (t4 - t3)).as_ns() as f64) / 2.0
            }
            DelayMechanism::P2p => {
                let Some(turnaround) = ex.peer_turnaround_ns else {
                    return;
                };
                // mpd = ((t4 - t1) - (t3' - t2')) / 2
                (((t4 - t3).as_ns() as f64) - turnaround) / 2.0
            }
        };
        if mpd >= 0.0 {
            self.mean_path_delay_ns = mpd;
        }
        self.delay_exchange = None;
    }

    /// Fold reaped transmit timestamps into the flows that wait on them.
    fn process_tx_timestamps(&mut self, stamps: Vec<socket::TxTimestamp>) {
        for ts in stamps {
            if self.emulating_no_tx_ts() {
                continue;
            }
            if !self.tx_tracker.complete(&ts) {
                continue;
            }
            match ts.message_type {
                MessageType::Sync => {
                    // Two-step master: the precise origin goes out now.
                    let precise = ts.timestamp;
                    self.send_follow_up(ts.sequence_id, precise);
                }
                MessageType::DelayReq | MessageType::PdelayReq => {
                    if let Some(mut ex) = self.delay_exchange {
                        if ex.sequence_id == ts.sequence_id {
                            ex.t3 = Some(ts.timestamp);
                            self.delay_exchange = Some(ex);
                            self.try_complete_delay();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Periodic health pass: expire foreign masters and in-flight transmit
    /// timestamps, then recompute alarm bits from message freshness.
    fn watchdog(&mut self, _ctx: &mut ThreadContext) {
        let now = TimeSpec::now(ClockDomain::Monotonic);
        self.foreign.expire(now, self.announce_timeout());

        if self.tx_tracker.expire(now) > 0 || self.emulating_no_tx_ts() {
            self.alarms.insert(Alarm::NO_TX_TIMESTAMPS);
        } else if self.tx_tracker.outstanding() == 0 {
            self.alarms.remove(Alarm::NO_TX_TIMESTAMPS);
        }

        if self.missing_rx_timestamps > 0 {
            self.alarms.insert(Alarm::NO_RX_TIMESTAMPS);
            self.missing_rx_timestamps = 0;
        } else {
            self.alarms.remove(Alarm::NO_RX_TIMESTAMPS);
        }

        if self.state == PortState::Slave || self.state == PortState::Uncalibrated {
            let window = TimeSpec::from_secs_f64(self.ptp.timestamp_window_s.max(
                2.0 * self.sync_interval().as_secs_f64(),
            ));
            let stale = |t: Option<TimeSpec>| t.map_or(true, |t| now - t > window);

            self.alarms.set(Alarm::NO_SYNC_PKTS, stale(self.rx_ages.sync));
            self.alarms.set(
                Alarm::NO_FOLLOW_UPS,
                !stale(self.rx_ages.sync) && self.pending_sync.is_some()
                    && stale(self.rx_ages.follow_up),
            );
            match self.profile.delay_mechanism {
                DelayMechanism::E2e => {
                    self.alarms
                        .set(Alarm::NO_DELAY_RESPS, stale(self.rx_ages.delay_resp));
                    self.alarms.remove(Alarm::NO_PDELAY_RESPS);
                    self.alarms.remove(Alarm::NO_PDELAY_RESP_FOLLOW_UPS);
                }
                DelayMechanism::P2p => {
                    self.alarms
                        .set(Alarm::NO_PDELAY_RESPS, stale(self.rx_ages.pdelay_resp));
                    self.alarms.set(
                        Alarm::NO_PDELAY_RESP_FOLLOW_UPS,
                        stale(self.rx_ages.pdelay_resp_follow_up),
                    );
                    self.alarms.remove(Alarm::NO_DELAY_RESPS);
                }
            }
        } else {
            self.alarms.remove(
                Alarm::NO_SYNC_PKTS
                    | Alarm::NO_FOLLOW_UPS
                    | Alarm::NO_DELAY_RESPS
                    | Alarm::NO_PDELAY_RESPS
                    | Alarm::NO_PDELAY_RESP_FOLLOW_UPS,
            );
        }
    }

    fn grandmaster(&self) -> GrandmasterInfo {
        match &self.parent {
            Some((_, announce)) => GrandmasterInfo {
                clock_id: crate::clocks::HwId(announce.gm_identity),
                clock_class: announce.gm_quality.class,
                time_source: announce.time_source,
                accuracy_ns: accuracy_to_ns(announce.gm_quality.accuracy),
                variance: announce.gm_quality.variance,
                steps_removed: announce.steps_removed,
                time_traceable: true,
                freq_traceable: true,
            },
            None => {
                let own = self.own_announce();
                GrandmasterInfo {
                    clock_id: crate::clocks::HwId(own.gm_identity),
                    clock_class: own.gm_quality.class,
                    time_source: own.time_source,
                    accuracy_ns: accuracy_to_ns(own.gm_quality.accuracy),
                    variance: own.gm_quality.variance,
                    steps_removed: own.steps_removed,
                    time_traceable: false,
                    freq_traceable: false,
                }
            }
        }
    }

    fn resolve_interface(&mut self, table: &LinkTable) -> Result<()> {
        let ifname = self
            .cfg
            .interface
            .as_deref()
            .ok_or_else(|| Error::Config(format!("ptp {}: no interface", self.cfg.name)))?;
        let link = table
            .by_name(ifname)
            .ok_or_else(|| Error::NoSuchDevice(ifname.to_string()))?
            .clone();
        self.ifindex = link.ifindex;
        self.hw_ts = link.ts_caps.hw_complete();
        self.clock = self.services.registry.find_by_ifindex(link.ifindex);
        self.port_identity = PortIdentity {
            clock_id: self
                .clock
                .as_ref()
                .map(|c| c.hwid().0)
                .unwrap_or_else(|| crate::clocks::HwId::from_mac(link.perm_addr).0),
            port: 1,
        };
        if BondBypass::required(table, &link) {
            let rebuild = self
                .bypass
                .as_ref()
                .map_or(true, |b| b.composition_changed(table));
            if rebuild {
                log::info!(
                    "ptp {}: LACP bond with multiple members, building bypass sockets",
                    self.cfg.name
                );
                let mut bypass = BondBypass::build(table, &link, self.hw_ts);
                bypass.probe();
                self.bypass = Some(bypass);
            }
        } else {
            self.bypass = None;
        }
        Ok(())
    }
}

impl SyncModule for PtpModule {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()> {
        let latest = self.services.tables.latest_version();
        if let Some(table) = self.services.tables.get(latest) {
            self.resolve_interface(&table)?;
        } else if self.cfg.interface.is_none() {
            return Err(Error::Config(format!("ptp {}: no interface", self.cfg.name)));
        }

        if self.ifindex != 0 {
            let ifname = self.cfg.interface.clone().unwrap_or_default();
            match PtpSocket::open(self.ifindex, &ifname, self.hw_ts) {
                Ok(sock) => {
                    ctx.add_user_fd(sock.raw(), true, false)?;
                    self.socket = Some(sock);
                }
                Err(e) => {
                    log::warn!("ptp {}: socket open failed: {e}", self.cfg.name);
                    self.set_state(PortState::Faulty);
                }
            }
        }

        ctx.create_timer(TIMER_ANNOUNCE_TIMEOUT, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_ANNOUNCE_TX, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_SYNC_TX, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_DELAY_REQ, ClockDomain::Monotonic)?;
        ctx.create_timer(TIMER_WATCHDOG, ClockDomain::Monotonic)?;
        ctx.start_timer(TIMER_WATCHDOG, TimerSpec::periodic(WATCHDOG_INTERVAL))?;

        if self.state != PortState::Faulty {
            self.set_state(PortState::Listening);
            self.restart_announce_timeout(ctx);
        }
        Ok(())
    }

    fn control(&mut self, mask: ControlFlags, flags: ControlFlags) {
        let before = self.control;
        self.control = (self.control - mask) | (flags & mask);

        if mask.contains(ControlFlags::LEAP_SECOND_GUARD)
            && before.contains(ControlFlags::LEAP_SECOND_GUARD)
            && !self.control.contains(ControlFlags::LEAP_SECOND_GUARD)
        {
            // Guard released: hold off until the next announce.
            self.resume_after_announce = true;
        }
        if mask.contains(ControlFlags::TIMESTAMP_PROCESSING) {
            if !self.control.contains(ControlFlags::TIMESTAMP_PROCESSING) {
                self.set_state(PortState::Disabled);
            } else if self.state == PortState::Disabled {
                self.set_state(PortState::Listening);
                self.foreign.clear();
                self.parent = None;
            }
        }
    }

    fn status(&self) -> SyncInstanceStatus {
        let mut s = SyncInstanceStatus::new(&self.cfg.name, ModuleKind::Ptp, self.cfg.priority);
        s.state = self.state.to_sync_state();
        s.alarms = self.alarms;
        s.clock = self.clock.clone();
        s.offset_from_master_ns = self.offset_ns;
        s.last_measurement = self.last_measurement;
        s.grandmaster = self.grandmaster();
        s.local_accuracy_ns = if self.hw_ts { 100.0 } else { 50_000.0 };
        s.control = self.control;
        s.leap59 = self.leap59;
        s.leap61 = self.leap61;
        s
    }

    fn step_clock(&mut self, offset: TimeSpec) -> Result<()> {
        let Some(clock) = &self.clock else {
            return Ok(());
        };
        self.services.registry.adjust_time(clock, offset)
    }

    fn update_grandmaster(&mut self, info: &GrandmasterInfo) {
        self.gm_override = Some(info.clone());
    }

    fn test_mode(&mut self, id: u32, _params: [i64; 3]) {
        self.set_test_mode(match id {
            1 => TestMode::TimestampJitter,
            2 => TestMode::EmulateNoTxTimestamps,
            _ => TestMode::None,
        });
    }

    fn update_leap(&mut self, leap59: bool, leap61: bool) {
        self.leap59 = leap59;
        self.leap61 = leap61;
    }

    fn save_state(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_state_header(w, &self.status())?;
        writeln!(w, "module: ptp")?;
        writeln!(w, "port-state: {}", self.state)?;
        writeln!(w, "port-identity: {}", self.port_identity)?;
        if let Some((parent, _)) = &self.parent {
            writeln!(w, "parent: {parent}")?;
        }
        writeln!(w, "mean-path-delay-ns: {:.1}", self.mean_path_delay_ns)?;
        writeln!(w, "foreign-masters: {}", self.foreign.len())
    }

    fn write_topology(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "ptp port {} [{}]", self.port_identity, self.state)?;
        for rec in self.foreign.records() {
            writeln!(
                w,
                "  foreign {} gm {:02x?} class {} steps {}",
                rec.port_identity,
                rec.announce.gm_identity,
                rec.announce.gm_quality.class,
                rec.announce.steps_removed
            )?;
        }
        if let Some(bypass) = &self.bypass {
            writeln!(
                w,
                "  bond bypass: {} sockets, valid mask {:#018x}",
                bypass.sockets().len(),
                bypass.valid_mask()
            )?;
        }
        Ok(())
    }

    fn wants_link_tables(&self) -> bool {
        true
    }

    fn on_link_table(&mut self, ctx: &mut ThreadContext, table: &LinkTable) {
        // The packet in hand (if any) was finished before this runs; the
        // reactor serializes message and fd callbacks.
        match self.resolve_interface(table) {
            Ok(()) => {
                self.alarms.remove(Alarm::INTERFACE_GONE);
                if self.socket.is_none() && self.ifindex != 0 {
                    let ifname = self.cfg.interface.clone().unwrap_or_default();
                    match PtpSocket::open(self.ifindex, &ifname, self.hw_ts) {
                        Ok(sock) => {
                            if let Err(e) = ctx.add_user_fd(sock.raw(), true, false) {
                                log::warn!("ptp {}: watch socket: {e}", self.cfg.name);
                            }
                            self.socket = Some(sock);
                            self.set_state(PortState::Listening);
                            self.restart_announce_timeout(ctx);
                        }
                        Err(e) => {
                            log::warn!("ptp {}: socket open failed: {e}", self.cfg.name);
                            self.set_state(PortState::Faulty);
                        }
                    }
                } else if self.state == PortState::Faulty && self.socket.is_some() {
                    self.set_state(PortState::Listening);
                    self.restart_announce_timeout(ctx);
                }
            }
            Err(e) => {
                log::warn!("ptp {}: interface lost: {e}", self.cfg.name);
                self.alarms.insert(Alarm::INTERFACE_GONE);
                self.set_state(PortState::Faulty);
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut ThreadContext, id: TimerId, _expiries: u64) {
        match id {
            TIMER_ANNOUNCE_TIMEOUT => {
                if matches!(
                    self.state,
                    PortState::Listening | PortState::Uncalibrated | PortState::Slave
                ) {
                    log::info!(
                        "ptp {}: announce receipt timeout in {}",
                        self.cfg.name,
                        self.state
                    );
                    let now = TimeSpec::now(ClockDomain::Monotonic);
                    let timeout = self.announce_timeout();
                    self.foreign.expire(now, timeout);
                    self.parent = None;
                    self.run_bmca(ctx);
                }
            }
            TIMER_ANNOUNCE_TX => {
                if self.state == PortState::PreMaster {
                    self.set_state(PortState::Master);
                }
                if self.state == PortState::Master {
                    self.send_announce();
                }
            }
            TIMER_SYNC_TX => {
                if self.state == PortState::Master {
                    self.send_sync();
                }
            }
            TIMER_DELAY_REQ => {
                if self.state == PortState::Slave && !self.timestamps_gated() {
                    self.send_delay_req();
                }
            }
            TIMER_WATCHDOG => {
                self.watchdog(ctx);
                if let Some(bypass) = &mut self.bypass {
                    bypass.reap_probes();
                }
            }
            other => log::debug!("ptp {}: unexpected {other}", self.cfg.name),
        }
    }

    fn on_user_fds(&mut self, ctx: &mut ThreadContext, ready: &[Readiness]) {
        let Some(sock_fd) = self.socket.as_ref().map(|s| s.raw()) else {
            return;
        };
        for r in ready {
            if r.fd != sock_fd {
                continue;
            }
            if r.error {
                // Error-queue readiness: transmit timestamps to reap.
                let stamps = self
                    .socket
                    .as_ref()
                    .map(|s| s.recv_tx_timestamps())
                    .unwrap_or_default();
                self.process_tx_timestamps(stamps);
            }
            if r.readable {
                let frames: Vec<RxFrame> = self
                    .socket
                    .as_ref()
                    .map(|s| s.recv_all())
                    .unwrap_or_default();
                for frame in frames {
                    match PtpMessage::decode(&frame.data) {
                        Ok(msg) => self.process_message(ctx, msg, frame.hw_timestamp),
                        Err(e) => log::debug!("ptp {}: bad frame: {e}", self.cfg.name),
                    }
                }
            }
        }
    }

    fn on_shutdown(&mut self, ctx: &mut ThreadContext) {
        if let Some(sock) = &self.socket {
            let _ = ctx.remove_user_fd(sock.raw());
        }
        self.socket = None;
        self.bypass = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::{ClockRegistry, HardwareLock};
    use crate::link::LinkTableSet;
    use crate::time::NSEC_PER_SEC as NS;

    fn services() -> ModuleServices {
        ModuleServices {
            registry: Arc::new(ClockRegistry::new(Arc::new(HardwareLock::new()))),
            tables: Arc::new(LinkTableSet::new()),
            state_dir: std::env::temp_dir(),
        }
    }

    fn module() -> PtpModule {
        let mut m = PtpModule::new(
            InstanceConfig {
                name: "ptp0".into(),
                module: ModuleKind::Ptp,
                interface: Some("eth0".into()),
                priority: 128,
                ptp: PtpConfig::default(),
                clock: None,
            },
            services(),
        );
        m.port_identity = PortIdentity {
            clock_id: [0xaa; 8],
            port: 1,
        };
        m.state = PortState::Listening;
        m
    }

    fn announce_from(clock_id: [u8; 8], class: u8, steps: u16) -> PtpMessage {
        let sender = PortIdentity { clock_id, port: 1 };
        let header = PtpHeader::new(MessageType::Announce, 0, sender);
        PtpMessage::new(
            header,
            PtpBody::Announce(AnnounceBody {
                gm_priority1: 128,
                gm_quality: ClockQuality {
                    class,
                    accuracy: 0x21,
                    variance: 0x4e5d,
                },
                gm_priority2: 128,
                gm_identity: clock_id,
                steps_removed: steps,
                time_source: 0x20,
                ..Default::default()
            }),
        )
    }

    fn sync_from(clock_id: [u8; 8], seq: u16, two_step: bool, origin: TimeSpec) -> PtpMessage {
        let sender = PortIdentity { clock_id, port: 1 };
        let mut header = PtpHeader::new(MessageType::Sync, 0, sender);
        header.sequence_id = seq;
        if two_step {
            header.flags |= FLAG_TWO_STEP;
        }
        PtpMessage::new(
            header,
            PtpBody::Sync(WireTimestamp::from_timespec(origin).unwrap()),
        )
    }

    fn follow_up_from(clock_id: [u8; 8], seq: u16, precise: TimeSpec) -> PtpMessage {
        let sender = PortIdentity { clock_id, port: 1 };
        let mut header = PtpHeader::new(MessageType::FollowUp, 0, sender);
        header.sequence_id = seq;
        PtpMessage::new(
            header,
            PtpBody::FollowUp(WireTimestamp::from_timespec(precise).unwrap()),
        )
    }

    /// Drive the module's processing paths directly with a bare context; no
    /// reactor loop is needed for these tests.
    fn with_ctx<F: FnOnce(&mut PtpModule, &mut ThreadContext)>(m: &mut PtpModule, f: F) {
        let mut ctx = crate::runtime::thread::test_context("ptp-test");
        for id in [
            TIMER_ANNOUNCE_TIMEOUT,
            TIMER_ANNOUNCE_TX,
            TIMER_SYNC_TX,
            TIMER_DELAY_REQ,
            TIMER_WATCHDOG,
        ] {
            ctx.create_timer(id, ClockDomain::Monotonic).unwrap();
        }
        f(m, &mut ctx);
    }

    #[test]
    fn test_qualified_foreign_master_wins_bmca() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            assert_eq!(m.state(), PortState::Listening);
            // Second announce qualifies the source.
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            assert_eq!(m.state(), PortState::Uncalibrated);
            assert!(m.parent.is_some());
        });
    }

    #[test]
    fn test_no_masters_leads_to_pre_master() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            m.run_bmca(ctx);
            assert_eq!(m.state(), PortState::PreMaster);
            // The first announce-tx tick promotes to MASTER.
            m.on_timer(ctx, TIMER_ANNOUNCE_TX, 1);
            assert_eq!(m.state(), PortState::Master);
        });
    }

    #[test]
    fn test_two_step_sync_produces_offset() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);

            let t1 = TimeSpec::new(1000, 0);
            let t2 = TimeSpec::new(1000, 500); // 500 ns later on our clock
            m.process_message(ctx, sync_from(gm, 7, true, TimeSpec::ZERO), Some(t2));
            assert!(m.last_measurement.is_none());
            m.process_message(ctx, follow_up_from(gm, 7, t1), None);
            assert_eq!(m.state(), PortState::Slave);
            assert!((m.offset_ns - 500.0).abs() < 1.0);
        });
    }

    #[test]
    fn test_one_step_sync_produces_offset() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            let t1 = TimeSpec::new(2000, 100);
            let t2 = TimeSpec::new(2000, 350);
            m.process_message(ctx, sync_from(gm, 9, false, t1), Some(t2));
            assert!((m.offset_ns - 250.0).abs() < 1.0);
        });
    }

    #[test]
    fn test_sync_without_rx_timestamp_counts_missing() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, sync_from(gm, 3, true, TimeSpec::ZERO), None);
            assert_eq!(m.missing_rx_timestamps, 1);
            m.watchdog(ctx);
            assert!(m.alarms.contains(Alarm::NO_RX_TIMESTAMPS));
        });
    }

    #[test]
    fn test_leap_guard_defers_and_resumes_on_announce() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);

            m.control(ControlFlags::LEAP_SECOND_GUARD, ControlFlags::LEAP_SECOND_GUARD);
            let t1 = TimeSpec::new(3000, 0);
            let t2 = TimeSpec::new(3000, 700);
            m.process_message(ctx, sync_from(gm, 11, false, t1), Some(t2));
            // Guarded: no measurement.
            assert!(m.last_measurement.is_none());

            m.control(ControlFlags::LEAP_SECOND_GUARD, ControlFlags::empty());
            // Still deferred until an announce passes.
            m.process_message(ctx, sync_from(gm, 12, false, t1), Some(t2));
            assert!(m.last_measurement.is_none());
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, sync_from(gm, 13, false, t1), Some(t2));
            assert!(m.last_measurement.is_some());
        });
    }

    #[test]
    fn test_disable_and_reenable_via_control_flags() {
        let mut m = module();
        with_ctx(&mut m, |m, _ctx| {
            m.control(ControlFlags::TIMESTAMP_PROCESSING, ControlFlags::empty());
            assert_eq!(m.state(), PortState::Disabled);
            m.control(
                ControlFlags::TIMESTAMP_PROCESSING,
                ControlFlags::TIMESTAMP_PROCESSING,
            );
            assert_eq!(m.state(), PortState::Listening);
        });
    }

    #[test]
    fn test_e2e_delay_exchange_updates_mpd() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            // Sync pair: one-way delay 1000 ns, offset 0.
            let t1 = TimeSpec::new(5000, 0);
            let t2 = TimeSpec::new(5000, 1000);
            m.process_message(ctx, sync_from(gm, 1, false, t1), Some(t2));

            // Delay exchange: t3 on our clock, t4 from the master.
            m.delay_exchange = Some(DelayExchange {
                sequence_id: 42,
                t3: Some(TimeSpec::new(5001, 0)),
                t4: None,
                peer_turnaround_ns: None,
            });
            let sender = PortIdentity { clock_id: gm, port: 1 };
            let mut header = PtpHeader::new(MessageType::DelayResp, 0, sender);
            header.sequence_id = 42;
            let resp = PtpMessage::new(
                header,
                PtpBody::DelayResp {
                    receive: WireTimestamp::from_timespec(TimeSpec::new(5001, 1000)).unwrap(),
                    requestor: m.port_identity,
                },
            );
            m.process_message(ctx, resp, None);
            // mpd = ((t2-t1) + (t4-t3))/2 = (1000 + 1000)/2
            assert!((m.mean_path_delay_ns - 1000.0).abs() < 1.0);
        });
    }

    #[test]
    fn test_status_surfaces_parent_grandmaster() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x05; 8];
            m.process_message(ctx, announce_from(gm, 6, 3), None);
            m.process_message(ctx, announce_from(gm, 6, 3), None);
            let s = m.status();
            assert_eq!(s.grandmaster.clock_id.0, gm);
            assert_eq!(s.grandmaster.clock_class, 6);
            assert_eq!(s.grandmaster.steps_removed, 3);
        });
    }

    #[test]
    fn test_offset_uses_mean_path_delay() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.mean_path_delay_ns = 400.0;
            let t1 = TimeSpec::new(7000, 0);
            let t2 = TimeSpec::new(7000, 1000);
            m.process_message(ctx, sync_from(gm, 2, false, t1), Some(t2));
            assert!((m.offset_ns - 600.0).abs() < 1.0);
        });
    }

    #[test]
    fn test_ignores_other_domains_and_self() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let mut msg = announce_from([0x01; 8], 6, 1);
            msg.header.domain = 44;
            m.process_message(ctx, msg.clone(), None);
            m.process_message(ctx, msg, None);
            assert!(m.foreign.is_empty());

            // Our own transmissions loop back and must be dropped.
            let own = announce_from(m.port_identity.clock_id, 6, 1);
            m.process_message(ctx, own.clone(), None);
            m.process_message(ctx, own, None);
            assert!(m.foreign.is_empty());
        });
    }

    #[test]
    fn test_large_offset_measurement() {
        let mut m = module();
        with_ctx(&mut m, |m, ctx| {
            let gm = [0x01; 8];
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            m.process_message(ctx, announce_from(gm, 6, 1), None);
            let t1 = TimeSpec::new(10_000, 0);
            let t2 = TimeSpec::new(10_002, 0); // 2 s ahead
            m.process_message(ctx, sync_from(gm, 2, false, t1), Some(t2));
            assert!((m.offset_ns - 2.0 * NS as f64).abs() < 1.0);
        });
    }
}
