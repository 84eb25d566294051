//! Raw netlink channels: route-netlink link events, generic-netlink control,
//! and the ethtool genetlink family for timestamping capability.
//!
//! Kernel structures are declared locally; only the socket calls come from
//! `libc`. All parsing is defensive: short or malformed attributes are
//! skipped, never trusted.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::link::{BondMode, LinkKind, TsCaps};

// Netlink message plumbing.
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x300;
const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

// Route-netlink.
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
pub const RTMGRP_LINK: u32 = 1;

// IFLA_* attributes of RTM_*LINK.
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_LINK: u16 = 5;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_PERM_ADDRESS: u16 = 54;

// IFLA_LINKINFO nest.
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const IFLA_INFO_SLAVE_KIND: u16 = 4;

// IFLA_INFO_DATA nests per kind.
const IFLA_VLAN_ID: u16 = 1;
const IFLA_BOND_MODE: u16 = 1;
const IFLA_BOND_ACTIVE_SLAVE: u16 = 2;

// Kernel bond modes.
const BOND_MODE_ACTIVEBACKUP: u8 = 1;
const BOND_MODE_8023AD: u8 = 4;

// Generic netlink control.
const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

/// Generic-netlink family names the engine resolves at startup.
pub const TEAM_GENL_NAME: &str = "team";
pub const ETHTOOL_GENL_NAME: &str = "ethtool";

// ethtool genetlink surface.
const ETHTOOL_MSG_TSINFO_GET: u8 = 25;
const ETHTOOL_A_HEADER_DEV_INDEX: u16 = 1;
const ETHTOOL_A_TSINFO_HEADER: u16 = 1;
const ETHTOOL_A_TSINFO_TIMESTAMPING: u16 = 2;
const ETHTOOL_A_TSINFO_PHC_INDEX: u16 = 5;

// team genetlink surface.
const TEAM_CMD_OPTIONS_GET: u8 = 2;
const TEAM_ATTR_TEAM_IFINDEX: u16 = 1;
const TEAM_ATTR_LIST_OPTION: u16 = 2;
const TEAM_ATTR_ITEM_OPTION: u16 = 1;
const TEAM_ATTR_OPTION_NAME: u16 = 1;
const TEAM_ATTR_OPTION_TYPE: u16 = 3;
const TEAM_ATTR_OPTION_DATA: u16 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
struct NlMsgHdr {
    len: u32,
    msg_type: u16,
    flags: u16,
    seq: u32,
    pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IfInfoMsg {
    family: u8,
    _pad: u8,
    if_type: u16,
    index: i32,
    flags: u32,
    change: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GenlMsgHdr {
    cmd: u8,
    version: u8,
    reserved: u16,
}

const NLMSG_HDRLEN: usize = std::mem::size_of::<NlMsgHdr>();
const GENL_HDRLEN: usize = std::mem::size_of::<GenlMsgHdr>();

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// One parsed netlink attribute.
struct NlAttr<'a> {
    kind: u16,
    data: &'a [u8],
}

fn parse_attrs(mut buf: &[u8]) -> Vec<NlAttr<'_>> {
    let mut attrs = Vec::new();
    while buf.len() >= 4 {
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let kind = u16::from_ne_bytes([buf[2], buf[3]]);
        if len < 4 || len > buf.len() {
            break;
        }
        attrs.push(NlAttr {
            kind: kind & NLA_TYPE_MASK,
            data: &buf[4..len],
        });
        let step = align4(len);
        if step >= buf.len() {
            break;
        }
        buf = &buf[step..];
    }
    attrs
}

fn attr_u16(a: &NlAttr<'_>) -> Option<u16> {
    a.data
        .get(..2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

fn attr_u32(a: &NlAttr<'_>) -> Option<u32> {
    a.data
        .get(..4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

fn attr_i32(a: &NlAttr<'_>) -> Option<i32> {
    attr_u32(a).map(|v| v as i32)
}

fn attr_str(a: &NlAttr<'_>) -> Option<String> {
    let end = a.data.iter().position(|&b| b == 0).unwrap_or(a.data.len());
    std::str::from_utf8(&a.data[..end]).ok().map(str::to_string)
}

fn put_attr(buf: &mut Vec<u8>, kind: u16, data: &[u8]) {
    let len = (4 + data.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(data);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// The interface fields one RTM_NEWLINK carries.
#[derive(Debug, Clone, Default)]
pub struct LinkNotification {
    pub ifindex: i32,
    pub if_type: u16,
    pub flags: u32,
    pub family: u8,
    pub name: String,
    pub kind: LinkKind,
    pub slave_kind_present: bool,
    pub master_ifindex: i32,
    pub parent_ifindex: i32,
    pub perm_addr: [u8; 6],
    pub vlan_id: u16,
    pub bond_mode: BondMode,
    pub active_slave_ifindex: i32,
}

/// Events surfaced by one receive pass over a netlink socket.
#[derive(Debug)]
pub enum NlEvent {
    NewLink(LinkNotification),
    DelLink(i32),
    /// End of a dump.
    Done,
    /// Resolved generic-netlink family.
    Family { name: String, id: u16 },
    /// Timestamping info for one interface.
    TsInfo {
        ifindex: i32,
        caps: TsCaps,
        phc_index: i32,
    },
    /// Team runner details for one team interface.
    TeamInfo {
        ifindex: i32,
        mode: BondMode,
        active_port_ifindex: i32,
    },
    /// Kernel-reported error for a request (negative errno, 0 is an ack).
    NlError(i32),
}

/// A netlink socket, route or generic. The protocol matters at parse time:
/// route and generic netlink reuse the same message-type values (e.g.
/// `GENL_ID_CTRL` == `RTM_NEWLINK` == 16).
pub struct NetlinkSocket {
    fd: RawFd,
    protocol: i32,
    seq: u32,
    /// Resolved ethtool family id, needed to classify genl replies.
    ethtool_family: Option<u16>,
    team_family: Option<u16>,
}

impl NetlinkSocket {
    fn open(protocol: i32, groups: u32) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = Error::last_os();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(Self {
            fd,
            protocol,
            seq: 1,
            ethtool_family: None,
            team_family: None,
        })
    }

    /// Route-netlink socket subscribed to link events.
    pub fn open_route() -> Result<Self> {
        Self::open(libc::NETLINK_ROUTE, RTMGRP_LINK)
    }

    /// Generic-netlink socket for family control, team and ethtool traffic.
    pub fn open_generic() -> Result<Self> {
        Self::open(libc::NETLINK_GENERIC, 0)
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn ethtool_family(&self) -> Option<u16> {
        self.ethtool_family
    }

    pub fn team_family(&self) -> Option<u16> {
        self.team_family
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send_msg(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> Result<()> {
        let hdr = NlMsgHdr {
            len: (NLMSG_HDRLEN + payload.len()) as u32,
            msg_type,
            flags,
            seq: self.next_seq(),
            pid: 0,
        };
        let mut buf = Vec::with_capacity(hdr.len as usize);
        buf.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&hdr as *const NlMsgHdr as *const u8, NLMSG_HDRLEN)
        });
        buf.extend_from_slice(payload);
        let n = unsafe {
            libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0)
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Request a full interface dump.
    pub fn request_link_dump(&mut self) -> Result<()> {
        let ifi = IfInfoMsg::default();
        let payload = unsafe {
            std::slice::from_raw_parts(
                &ifi as *const IfInfoMsg as *const u8,
                std::mem::size_of::<IfInfoMsg>(),
            )
        };
        self.send_msg(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP, payload)
    }

    /// Ask the genl controller for a family id by name.
    pub fn request_family(&mut self, name: &str) -> Result<()> {
        let mut payload = Vec::new();
        let genl = GenlMsgHdr {
            cmd: CTRL_CMD_GETFAMILY,
            version: 1,
            reserved: 0,
        };
        payload.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&genl as *const GenlMsgHdr as *const u8, GENL_HDRLEN)
        });
        let mut name_z = name.as_bytes().to_vec();
        name_z.push(0);
        put_attr(&mut payload, CTRL_ATTR_FAMILY_NAME, &name_z);
        self.send_msg(GENL_ID_CTRL, NLM_F_REQUEST, &payload)
    }

    /// Query ethtool TSINFO for one interface. Requires the ethtool family
    /// id to have been resolved.
    pub fn request_tsinfo(&mut self, ifindex: i32) -> Result<()> {
        let family = self
            .ethtool_family
            .ok_or(Error::TryAgain("ethtool family not yet resolved"))?;
        let mut payload = Vec::new();
        let genl = GenlMsgHdr {
            cmd: ETHTOOL_MSG_TSINFO_GET,
            version: 1,
            reserved: 0,
        };
        payload.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&genl as *const GenlMsgHdr as *const u8, GENL_HDRLEN)
        });
        // Nested request header naming the device.
        let mut header = Vec::new();
        put_attr(&mut header, ETHTOOL_A_HEADER_DEV_INDEX, &ifindex.to_ne_bytes());
        put_attr(
            &mut payload,
            ETHTOOL_A_TSINFO_HEADER | NLA_F_NESTED,
            &header,
        );
        self.send_msg(family, NLM_F_REQUEST, &payload)
    }

    /// Query a team interface's runner options. Requires the team family id.
    pub fn request_team_options(&mut self, ifindex: i32) -> Result<()> {
        let family = self
            .team_family
            .ok_or(Error::TryAgain("team family not yet resolved"))?;
        let mut payload = Vec::new();
        let genl = GenlMsgHdr {
            cmd: TEAM_CMD_OPTIONS_GET,
            version: 1,
            reserved: 0,
        };
        payload.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&genl as *const GenlMsgHdr as *const u8, GENL_HDRLEN)
        });
        put_attr(&mut payload, TEAM_ATTR_TEAM_IFINDEX, &(ifindex as u32).to_ne_bytes());
        self.send_msg(family, NLM_F_REQUEST, &payload)
    }

    /// Drain the socket, parsing every queued kernel message. ENOBUFS maps
    /// to [`Error::Overflow`] so the caller re-dumps.
    pub fn recv_events(&mut self) -> Result<Vec<NlEvent>> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; 65536];
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::ENOBUFS) => return Err(Error::Overflow),
                    _ => return Err(Error::Io(err)),
                }
            }
            if n == 0 {
                break;
            }
            self.parse_stream(&buf[..n as usize], &mut events);
        }
        Ok(events)
    }

    fn parse_stream(&mut self, mut data: &[u8], events: &mut Vec<NlEvent>) {
        while data.len() >= NLMSG_HDRLEN {
            let hdr: NlMsgHdr =
                unsafe { std::ptr::read_unaligned(data.as_ptr() as *const NlMsgHdr) };
            let total = hdr.len as usize;
            if total < NLMSG_HDRLEN || total > data.len() {
                break;
            }
            let body = &data[NLMSG_HDRLEN..total];
            match hdr.msg_type {
                NLMSG_DONE => events.push(NlEvent::Done),
                NLMSG_ERROR => {
                    let errno = body
                        .get(..4)
                        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                        .unwrap_or(0);
                    if errno != 0 {
                        events.push(NlEvent::NlError(errno));
                    }
                }
                RTM_NEWLINK if self.protocol == libc::NETLINK_ROUTE => {
                    if let Some(link) = parse_link(body) {
                        events.push(NlEvent::NewLink(link));
                    }
                }
                RTM_DELLINK if self.protocol == libc::NETLINK_ROUTE => {
                    if body.len() >= std::mem::size_of::<IfInfoMsg>() {
                        let ifi: IfInfoMsg = unsafe {
                            std::ptr::read_unaligned(body.as_ptr() as *const IfInfoMsg)
                        };
                        events.push(NlEvent::DelLink(ifi.index));
                    }
                }
                GENL_ID_CTRL => {
                    if let Some(ev) = self.parse_ctrl(body) {
                        events.push(ev);
                    }
                }
                other => {
                    if Some(other) == self.ethtool_family {
                        if let Some(ev) = parse_tsinfo(body) {
                            events.push(ev);
                        }
                    } else if Some(other) == self.team_family {
                        if let Some(ev) = parse_team_options(body) {
                            events.push(ev);
                        }
                    } else {
                        log::trace!("netlink: ignoring message type {other}");
                    }
                }
            }
            let step = align4(total);
            if step >= data.len() {
                break;
            }
            data = &data[step..];
        }
    }

    fn parse_ctrl(&mut self, body: &[u8]) -> Option<NlEvent> {
        if body.len() < GENL_HDRLEN {
            return None;
        }
        let attrs = parse_attrs(&body[GENL_HDRLEN..]);
        let mut name = None;
        let mut id = None;
        for a in &attrs {
            match a.kind {
                CTRL_ATTR_FAMILY_NAME => name = attr_str(a),
                CTRL_ATTR_FAMILY_ID => id = attr_u16(a),
                _ => {}
            }
        }
        let (name, id) = (name?, id?);
        match name.as_str() {
            ETHTOOL_GENL_NAME => self.ethtool_family = Some(id),
            TEAM_GENL_NAME => self.team_family = Some(id),
            _ => {}
        }
        Some(NlEvent::Family { name, id })
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn parse_link(body: &[u8]) -> Option<LinkNotification> {
    if body.len() < std::mem::size_of::<IfInfoMsg>() {
        return None;
    }
    let ifi: IfInfoMsg = unsafe { std::ptr::read_unaligned(body.as_ptr() as *const IfInfoMsg) };
    let mut link = LinkNotification {
        ifindex: ifi.index,
        if_type: ifi.if_type,
        flags: ifi.flags,
        family: ifi.family,
        ..Default::default()
    };
    let attrs = parse_attrs(&body[std::mem::size_of::<IfInfoMsg>()..]);
    for a in &attrs {
        match a.kind {
            IFLA_IFNAME => {
                if let Some(n) = attr_str(a) {
                    link.name = n;
                }
            }
            IFLA_MASTER => {
                if let Some(m) = attr_i32(a) {
                    link.master_ifindex = m;
                }
            }
            IFLA_LINK => {
                if let Some(p) = attr_i32(a) {
                    link.parent_ifindex = p;
                }
            }
            IFLA_ADDRESS | IFLA_PERM_ADDRESS => {
                // Prefer the permanent address when both are present;
                // IFLA_PERM_ADDRESS sorts after IFLA_ADDRESS so later wins.
                if a.data.len() >= 6 {
                    link.perm_addr.copy_from_slice(&a.data[..6]);
                }
            }
            IFLA_LINKINFO => parse_linkinfo(a.data, &mut link),
            _ => {}
        }
    }
    Some(link)
}

fn parse_linkinfo(nest: &[u8], link: &mut LinkNotification) {
    let mut kind = LinkKind::Other;
    let mut data: Option<&[u8]> = None;
    for a in parse_attrs(nest) {
        match a.kind {
            IFLA_INFO_KIND => {
                if let Some(k) = attr_str(&a) {
                    kind = LinkKind::from_info_kind(&k);
                }
            }
            IFLA_INFO_SLAVE_KIND => link.slave_kind_present = true,
            IFLA_INFO_DATA => data = Some(a.data),
            _ => {}
        }
    }
    link.kind = kind;
    let Some(data) = data else { return };
    match kind {
        LinkKind::Vlan => {
            for a in parse_attrs(data) {
                if a.kind == IFLA_VLAN_ID {
                    if let Some(v) = attr_u16(&a) {
                        link.vlan_id = v;
                    }
                }
            }
        }
        LinkKind::Bond => {
            for a in parse_attrs(data) {
                match a.kind {
                    IFLA_BOND_MODE => {
                        link.bond_mode = match a.data.first().copied() {
                            Some(BOND_MODE_ACTIVEBACKUP) => BondMode::ActiveBackup,
                            Some(BOND_MODE_8023AD) => BondMode::Lacp,
                            _ => BondMode::Unsupported,
                        };
                    }
                    IFLA_BOND_ACTIVE_SLAVE => {
                        if let Some(s) = attr_i32(&a) {
                            link.active_slave_ifindex = s;
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn parse_tsinfo(body: &[u8]) -> Option<NlEvent> {
    if body.len() < GENL_HDRLEN {
        return None;
    }
    let mut ifindex = 0;
    let mut caps = TsCaps::empty();
    let mut phc_index = -1;
    for a in parse_attrs(&body[GENL_HDRLEN..]) {
        match a.kind {
            ETHTOOL_A_TSINFO_HEADER => {
                for h in parse_attrs(a.data) {
                    if h.kind == ETHTOOL_A_HEADER_DEV_INDEX {
                        if let Some(i) = attr_i32(&h) {
                            ifindex = i;
                        }
                    }
                }
            }
            ETHTOOL_A_TSINFO_TIMESTAMPING => {
                if let Some(raw) = attr_u32(&a) {
                    caps = TsCaps::from_bits_truncate(raw);
                }
            }
            ETHTOOL_A_TSINFO_PHC_INDEX => {
                if let Some(p) = attr_i32(&a) {
                    phc_index = p;
                }
            }
            _ => {}
        }
    }
    if ifindex == 0 {
        return None;
    }
    Some(NlEvent::TsInfo {
        ifindex,
        caps,
        phc_index,
    })
}

fn parse_team_options(body: &[u8]) -> Option<NlEvent> {
    if body.len() < GENL_HDRLEN {
        return None;
    }
    let mut ifindex = 0;
    let mut mode = BondMode::Unsupported;
    let mut active_port = 0;
    for a in parse_attrs(&body[GENL_HDRLEN..]) {
        match a.kind {
            TEAM_ATTR_TEAM_IFINDEX => {
                if let Some(i) = attr_i32(&a) {
                    ifindex = i;
                }
            }
            TEAM_ATTR_LIST_OPTION => {
                for item in parse_attrs(a.data) {
                    if item.kind != TEAM_ATTR_ITEM_OPTION {
                        continue;
                    }
                    let mut name = None;
                    let mut data: Option<&[u8]> = None;
                    for f in parse_attrs(item.data) {
                        match f.kind {
                            TEAM_ATTR_OPTION_NAME => name = attr_str(&f),
                            TEAM_ATTR_OPTION_DATA => data = Some(f.data),
                            TEAM_ATTR_OPTION_TYPE => {}
                            _ => {}
                        }
                    }
                    let (Some(name), Some(data)) = (name, data) else {
                        continue;
                    };
                    match name.as_str() {
                        "mode" => {
                            let end =
                                data.iter().position(|&b| b == 0).unwrap_or(data.len());
                            mode = match std::str::from_utf8(&data[..end]).unwrap_or("") {
                                "activebackup" => BondMode::ActiveBackup,
                                "lacp" => BondMode::Lacp,
                                _ => BondMode::Unsupported,
                            };
                        }
                        "activeport" => {
                            if data.len() >= 4 {
                                active_port = i32::from_ne_bytes([
                                    data[0], data[1], data[2], data[3],
                                ]);
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if ifindex == 0 {
        return None;
    }
    Some(NlEvent::TeamInfo {
        ifindex,
        mode,
        active_port_ifindex: active_port,
    })
}
