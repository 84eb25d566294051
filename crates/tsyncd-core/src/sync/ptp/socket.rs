//! Raw PTP-over-Ethernet sockets: hardware timestamping, transmit-timestamp
//! reaping from the kernel error queue, and the LACP bond bypass socket set.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::link::{Link, LinkTable};
use crate::sync::ptp::wire::{self, MessageType, PtpHeader};
use crate::time::TimeSpec;

// SO_TIMESTAMPING option bits.
const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

// linux/net_tstamp.h hwtstamp_config, set through SIOCSHWTSTAMP.
const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_ON: i32 = 1;
const HWTSTAMP_FILTER_PTP_V2_EVENT: i32 = 12;

#[repr(C)]
struct HwTstampConfig {
    flags: i32,
    tx_type: i32,
    rx_filter: i32,
}

#[repr(C)]
struct IfreqTstamp {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_data: *mut HwTstampConfig,
}

/// One received frame with its timestamp and originating interface.
#[derive(Debug)]
pub struct RxFrame {
    pub data: Vec<u8>,
    /// Raw hardware receive timestamp, if delivered.
    pub hw_timestamp: Option<TimeSpec>,
    pub src_ifindex: i32,
}

/// A transmit timestamp recovered from the error queue, correlated back to
/// the message it stamps.
#[derive(Debug, Clone, Copy)]
pub struct TxTimestamp {
    pub message_type: MessageType,
    pub sequence_id: u16,
    pub timestamp: TimeSpec,
    pub tx_ifindex: i32,
}

fn cmsg_hw_timestamp(msg: &libc::msghdr) -> Option<TimeSpec> {
    // SCM_TIMESTAMPING carries [software, legacy, raw-hardware].
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::SOL_SOCKET && c.cmsg_type == libc::SCM_TIMESTAMPING {
            let data = unsafe { libc::CMSG_DATA(cmsg) } as *const libc::timespec;
            let raw = unsafe { *data.add(2) };
            let sw = unsafe { *data };
            let hw = TimeSpec::from_timespec(raw);
            if !hw.is_zero() {
                return Some(hw);
            }
            let sw = TimeSpec::from_timespec(sw);
            if !sw.is_zero() {
                return Some(sw);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

/// A PTP layer-2 socket bound to one interface (or a bond master).
pub struct PtpSocket {
    fd: RawFd,
    ifindex: i32,
}

impl PtpSocket {
    /// Open, bind and join the PTP multicast groups on `ifindex`. With
    /// `hw_ts` the NIC is switched into PTP event timestamping and the
    /// socket requests hardware timestamps both ways.
    pub fn open(ifindex: i32, ifname: &str, hw_ts: bool) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                (wire::ETH_P_1588 as u16).to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        let sock = Self { fd, ifindex };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (wire::ETH_P_1588 as u16).to_be();
        addr.sll_ifindex = ifindex;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::last_os());
        }

        for mcast in [wire::PTP_PRIMARY_MCAST, wire::PTP_PDELAY_MCAST] {
            sock.join_multicast(mcast)?;
        }
        if hw_ts {
            sock.enable_hw_timestamping(ifname)?;
        }
        Ok(sock)
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    fn join_multicast(&self, mac: [u8; 6]) -> Result<()> {
        let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
        mreq.mr_ifindex = self.ifindex;
        mreq.mr_type = libc::PACKET_MR_MULTICAST as libc::c_ushort;
        mreq.mr_alen = 6;
        mreq.mr_address[..6].copy_from_slice(&mac);
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    fn enable_hw_timestamping(&self, ifname: &str) -> Result<()> {
        let mut config = HwTstampConfig {
            flags: 0,
            tx_type: HWTSTAMP_TX_ON,
            rx_filter: HWTSTAMP_FILTER_PTP_V2_EVENT,
        };
        let mut ifr = IfreqTstamp {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_data: &mut config,
        };
        for (i, b) in ifname.bytes().take(libc::IFNAMSIZ - 1).enumerate() {
            ifr.ifr_name[i] = b;
        }
        if unsafe { libc::ioctl(self.fd, SIOCSHWTSTAMP, &mut ifr) } < 0 {
            return Err(Error::last_os());
        }

        let flags: u32 = SOF_TIMESTAMPING_TX_HARDWARE
            | SOF_TIMESTAMPING_RX_HARDWARE
            | SOF_TIMESTAMPING_RAW_HARDWARE;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMPING,
                &flags as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Transmit a PTP frame to `dest` through this socket.
    pub fn send_to(&self, frame: &[u8], dest: [u8; 6]) -> Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (wire::ETH_P_1588 as u16).to_be();
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dest);
        let n = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
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

    fn recvmsg(&self, flags: libc::c_int) -> Option<(Vec<u8>, Option<TimeSpec>, i32)> {
        let mut buf = vec![0u8; 1500];
        let mut ctrl = [0u8; 512];
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut addr as *mut libc::sockaddr_ll as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = ctrl.len();

        let n = unsafe { libc::recvmsg(self.fd, &mut msg, flags) };
        if n <= 0 {
            return None;
        }
        buf.truncate(n as usize);
        let ts = cmsg_hw_timestamp(&msg);
        Some((buf, ts, addr.sll_ifindex))
    }

    /// Drain received frames.
    pub fn recv_all(&self) -> Vec<RxFrame> {
        let mut out = Vec::new();
        while let Some((data, hw_timestamp, src_ifindex)) = self.recvmsg(0) {
            out.push(RxFrame {
                data,
                hw_timestamp,
                src_ifindex,
            });
        }
        out
    }

    /// Drain the error queue: each entry is a looped copy of a transmitted
    /// event frame with its hardware transmit timestamp attached.
    pub fn recv_tx_timestamps(&self) -> Vec<TxTimestamp> {
        let mut out = Vec::new();
        while let Some((data, ts, tx_ifindex)) = self.recvmsg(libc::MSG_ERRQUEUE) {
            let Some(ts) = ts else { continue };
            let Ok(header) = PtpHeader::decode(&data) else {
                continue;
            };
            out.push(TxTimestamp {
                message_type: header.message_type,
                sequence_id: header.sequence_id,
                timestamp: ts,
                tx_ifindex,
            });
        }
        out
    }
}

impl Drop for PtpSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Sequence-correlation of in-flight transmit timestamps.
///
/// Every sent event frame registers here; the error-queue reap completes the
/// entry. Entries older than the configured window count as missing and feed
/// the `NO_TX_TIMESTAMPS` alarm.
pub struct TxTimestampTracker {
    window: TimeSpec,
    in_flight: HashMap<(u8, u16), TimeSpec>,
    pub completed: u64,
    pub expired: u64,
}

impl TxTimestampTracker {
    pub fn new(window: TimeSpec) -> Self {
        Self {
            window,
            in_flight: HashMap::new(),
            completed: 0,
            expired: 0,
        }
    }

    /// Register a just-sent event frame.
    pub fn expect(&mut self, message_type: MessageType, sequence_id: u16, now: TimeSpec) {
        self.in_flight
            .insert((message_type.to_nibble(), sequence_id), now);
    }

    /// Correlate a reaped timestamp. Returns false for stale or unknown ids.
    pub fn complete(&mut self, ts: &TxTimestamp) -> bool {
        if self
            .in_flight
            .remove(&(ts.message_type.to_nibble(), ts.sequence_id))
            .is_some()
        {
            self.completed += 1;
            true
        } else {
            false
        }
    }

    /// Expire entries older than the window; the count feeds the alarm.
    pub fn expire(&mut self, now: TimeSpec) -> usize {
        let cutoff = now - self.window;
        let before = self.in_flight.len();
        self.in_flight.retain(|_, sent| *sent >= cutoff);
        let dropped = before - self.in_flight.len();
        self.expired += dropped as u64;
        dropped
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }
}

/// Cap on auxiliary sockets across all bond members.
pub const MAX_AUX_SOCKETS: usize = 64;
/// Sockets opened per physical member.
pub const AUX_SOCKETS_PER_MEMBER: usize = 4;

/// One auxiliary socket of the bond bypass set.
pub struct AuxSocket {
    pub socket: Option<PtpSocket>,
    pub member_ifindex: i32,
    /// Interface the kernel actually transmits on, learned by probing.
    pub tx_ifindex: Option<i32>,
    /// Why this slot went invalid, if it did.
    pub invalid_reason: Option<&'static str>,
}

/// The LACP bond bypass: auxiliary sockets per physical member used to pin
/// timestamped traffic to symmetric paths when the active port is an 802.3ad
/// bond with multiple members.
pub struct BondBypass {
    bond_ifindex: i32,
    sockets: Vec<AuxSocket>,
    /// Composition signature used to trigger re-detection.
    member_signature: Vec<i32>,
}

impl BondBypass {
    /// Whether `link` needs the bypass at all: an 802.3ad bond with more
    /// than one member.
    pub fn required(table: &LinkTable, link: &Link) -> bool {
        link.kind.is_aggregate()
            && link.bond_mode == crate::link::BondMode::Lacp
            && table.slaves_of(link.ifindex).len() > 1
    }

    /// Open the socket set: four per member, bounded to the global cap, all
    /// bound to the bond's own address so the kernel hashes them across
    /// members.
    pub fn build(table: &LinkTable, bond: &Link, hw_ts: bool) -> Self {
        let members: Vec<&Link> = table.slaves_of(bond.ifindex);
        let mut sockets = Vec::new();
        'outer: for member in &members {
            for _ in 0..AUX_SOCKETS_PER_MEMBER {
                if sockets.len() >= MAX_AUX_SOCKETS {
                    log::warn!(
                        "bond {}: aux socket cap ({MAX_AUX_SOCKETS}) reached",
                        bond.name
                    );
                    break 'outer;
                }
                let slot = match PtpSocket::open(bond.ifindex, &bond.name, hw_ts) {
                    Ok(s) => AuxSocket {
                        socket: Some(s),
                        member_ifindex: member.ifindex,
                        tx_ifindex: None,
                        invalid_reason: None,
                    },
                    Err(e) => {
                        log::warn!("bond {}: aux socket open failed: {e}", bond.name);
                        AuxSocket {
                            socket: None,
                            member_ifindex: member.ifindex,
                            tx_ifindex: None,
                            invalid_reason: Some("open failed"),
                        }
                    }
                };
                sockets.push(slot);
            }
        }
        Self {
            bond_ifindex: bond.ifindex,
            sockets,
            member_signature: members.iter().map(|m| m.ifindex).collect(),
        }
    }

    pub fn bond_ifindex(&self) -> i32 {
        self.bond_ifindex
    }

    pub fn sockets(&self) -> &[AuxSocket] {
        &self.sockets
    }

    /// Valid sockets as a bitmask, one bit per slot.
    pub fn valid_mask(&self) -> u64 {
        let mut mask = 0u64;
        for (i, s) in self.sockets.iter().enumerate() {
            if s.socket.is_some() && s.invalid_reason.is_none() {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Send an empty probe datagram on every valid socket. The error-queue
    /// reap that follows reports each probe's actual transmit interface,
    /// building the (socket, ifindex) map used for later emissions.
    pub fn probe(&mut self) {
        let probe = [0u8; 0];
        for slot in &mut self.sockets {
            let Some(sock) = &slot.socket else { continue };
            if let Err(e) = sock.send_to(&probe, wire::PTP_PRIMARY_MCAST) {
                slot.invalid_reason = Some("probe send failed");
                log::debug!(
                    "bond bypass: probe on member {} failed: {e}",
                    slot.member_ifindex
                );
            }
        }
    }

    /// Fold the error-queue answer of one probe back into the map.
    pub fn note_probe_result(&mut self, slot_index: usize, tx_ifindex: i32) {
        if let Some(slot) = self.sockets.get_mut(slot_index) {
            slot.tx_ifindex = Some(tx_ifindex);
        }
    }

    /// Reap probe answers from every socket's error queue.
    pub fn reap_probes(&mut self) {
        for i in 0..self.sockets.len() {
            let result = self.sockets[i]
                .socket
                .as_ref()
                .map(|s| s.recv_tx_timestamps());
            if let Some(stamps) = result {
                if let Some(ts) = stamps.last() {
                    self.note_probe_result(i, ts.tx_ifindex);
                }
            }
        }
    }

    /// The first valid socket the kernel transmits via `ifindex`, if the
    /// probe map knows one.
    pub fn socket_for_tx_ifindex(&self, ifindex: i32) -> Option<&PtpSocket> {
        self.sockets
            .iter()
            .filter(|s| s.invalid_reason.is_none())
            .find(|s| s.tx_ifindex == Some(ifindex))
            .and_then(|s| s.socket.as_ref())
    }

    /// True when the bond's member composition changed since the set was
    /// built, requiring re-detection.
    pub fn composition_changed(&self, table: &LinkTable) -> bool {
        let members: Vec<i32> = table
            .slaves_of(self.bond_ifindex)
            .iter()
            .map(|m| m.ifindex)
            .collect();
        members != self.member_signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{BondMode, LinkKind};

    fn ts(sec: i64) -> TimeSpec {
        TimeSpec::new(sec, 0)
    }

    #[test]
    fn test_tx_tracker_correlates_by_type_and_sequence() {
        let mut t = TxTimestampTracker::new(ts(2));
        t.expect(MessageType::Sync, 10, ts(0));
        t.expect(MessageType::DelayReq, 10, ts(0));
        let stamp = TxTimestamp {
            message_type: MessageType::DelayReq,
            sequence_id: 10,
            timestamp: ts(1),
            tx_ifindex: 2,
        };
        assert!(t.complete(&stamp));
        assert!(!t.complete(&stamp));
        assert_eq!(t.outstanding(), 1);
        assert_eq!(t.completed, 1);
    }

    #[test]
    fn test_tx_tracker_expires_into_alarm_feed() {
        let mut t = TxTimestampTracker::new(ts(2));
        t.expect(MessageType::Sync, 1, ts(0));
        t.expect(MessageType::Sync, 2, ts(3));
        assert_eq!(t.expire(ts(4)), 1);
        assert_eq!(t.outstanding(), 1);
        assert_eq!(t.expired, 1);
    }

    #[test]
    fn test_bypass_required_only_for_multi_member_lacp() {
        let mut bond = Link::new(10, "bond0");
        bond.kind = LinkKind::Bond;
        bond.bond_mode = BondMode::Lacp;
        let mut s0 = Link::new(2, "eth0");
        s0.master_ifindex = 10;
        let mut s1 = Link::new(3, "eth1");
        s1.master_ifindex = 10;

        let two = LinkTable::new(1, vec![bond.clone(), s0.clone(), s1]);
        assert!(BondBypass::required(&two, two.by_index(10).unwrap()));

        let one = LinkTable::new(2, vec![bond.clone(), s0]);
        assert!(!BondBypass::required(&one, one.by_index(10).unwrap()));

        let mut ab = bond;
        ab.bond_mode = BondMode::ActiveBackup;
        let t = LinkTable::new(3, vec![ab]);
        assert!(!BondBypass::required(&t, t.by_index(10).unwrap()));
    }

    #[test]
    fn test_valid_mask_tracks_invalid_slots() {
        let mut bypass = BondBypass {
            bond_ifindex: 10,
            sockets: (0..6)
                .map(|i| AuxSocket {
                    socket: None,
                    member_ifindex: 2 + (i as i32 / 4),
                    tx_ifindex: None,
                    invalid_reason: Some("open failed"),
                })
                .collect(),
            member_signature: vec![2, 3],
        };
        assert_eq!(bypass.valid_mask(), 0);
        bypass.sockets[1].invalid_reason = None;
        // Still invalid without an actual socket.
        assert_eq!(bypass.valid_mask(), 0);
    }

    #[test]
    fn test_composition_change_detection() {
        let bypass = BondBypass {
            bond_ifindex: 10,
            sockets: Vec::new(),
            member_signature: vec![2, 3],
        };
        let mut bond = Link::new(10, "bond0");
        bond.kind = LinkKind::Bond;
        bond.bond_mode = BondMode::Lacp;
        let mut s0 = Link::new(2, "eth0");
        s0.master_ifindex = 10;
        let table = LinkTable::new(1, vec![bond, s0]);
        assert!(bypass.composition_changed(&table));
    }
}
