//! Authoritative in-process view of the kernel network topology.
//!
//! A dedicated thread ([`engine`]) ingests route-netlink and generic-netlink
//! events, folds them into a work-in-progress table, and publishes versioned
//! immutable snapshots through a four-slot ring ([`ring`]) handed to
//! consumers under reference counting.

pub mod engine;
pub mod netlink;
pub mod ring;

use bitflags::bitflags;

pub use engine::LinkEngine;
pub use ring::LinkTableSet;

/// Kernel interface kind as reported in `IFLA_LINKINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkKind {
    Vlan,
    Macvlan,
    Team,
    Bond,
    Bridge,
    Tunnel,
    Dummy,
    #[default]
    Other,
}

impl LinkKind {
    pub fn from_info_kind(kind: &str) -> Self {
        match kind {
            "vlan" => Self::Vlan,
            "macvlan" | "macvtap" => Self::Macvlan,
            "team" => Self::Team,
            "bond" => Self::Bond,
            "bridge" => Self::Bridge,
            "gre" | "gretap" | "ipip" | "sit" | "vti" | "ip6tnl" => Self::Tunnel,
            "dummy" => Self::Dummy,
            _ => Self::Other,
        }
    }

    /// True for kinds that aggregate slave ports.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Team | Self::Bond)
    }
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vlan => write!(f, "vlan"),
            Self::Macvlan => write!(f, "macvlan"),
            Self::Team => write!(f, "team"),
            Self::Bond => write!(f, "bond"),
            Self::Bridge => write!(f, "bridge"),
            Self::Tunnel => write!(f, "tunnel"),
            Self::Dummy => write!(f, "dummy"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Aggregation mode of a bond or team device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondMode {
    ActiveBackup,
    /// IEEE 802.3ad link aggregation.
    Lacp,
    #[default]
    Unsupported,
}

impl std::fmt::Display for BondMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActiveBackup => write!(f, "active-backup"),
            Self::Lacp => write!(f, "802.3ad"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

bitflags! {
    /// Hardware timestamping capabilities from ethtool `TSINFO`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TsCaps: u32 {
        const TX_HARDWARE = 1 << 0;
        const TX_SOFTWARE = 1 << 1;
        const RX_HARDWARE = 1 << 2;
        const RX_SOFTWARE = 1 << 3;
        const RAW_HARDWARE = 1 << 4;
    }
}

impl TsCaps {
    /// Everything needed for hardware-timestamped PTP.
    pub fn hw_complete(&self) -> bool {
        self.contains(TsCaps::TX_HARDWARE | TsCaps::RX_HARDWARE | TsCaps::RAW_HARDWARE)
    }
}

/// One kernel network-interface record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub ifindex: i32,
    pub name: String,
    /// ARPHRD_* interface type.
    pub if_type: u16,
    /// IFF_* flag word.
    pub flags: u32,
    pub family: u8,
    pub kind: LinkKind,
    /// Enslaving interface, 0 if none.
    pub master_ifindex: i32,
    /// Lower device a VLAN or macvlan stacks on, 0 if none.
    pub parent_ifindex: i32,
    /// Active slave of a bond/team, 0 if none or not applicable.
    pub active_slave_ifindex: i32,
    pub bond_mode: BondMode,
    pub vlan_id: u16,
    /// Permanent MAC address.
    pub perm_addr: [u8; 6],
    /// PHC device index from ethtool TSINFO, -1 when absent.
    pub phc_index: i32,
    pub ts_caps: TsCaps,
    pub is_slave: bool,
}

impl Link {
    pub fn new(ifindex: i32, name: &str) -> Self {
        Self {
            ifindex,
            name: name.to_string(),
            if_type: 0,
            flags: 0,
            family: 0,
            kind: LinkKind::Other,
            master_ifindex: 0,
            parent_ifindex: 0,
            active_slave_ifindex: 0,
            bond_mode: BondMode::Unsupported,
            vlan_id: 0,
            perm_addr: [0; 6],
            phc_index: -1,
            ts_caps: TsCaps::empty(),
            is_slave: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags & (libc::IFF_RUNNING as u32) != 0
    }

    pub fn is_up(&self) -> bool {
        self.flags & (libc::IFF_UP as u32) != 0
    }

    pub fn has_phc(&self) -> bool {
        self.phc_index >= 0
    }

    /// The fields whose change makes a new table version worth publishing.
    /// Flag changes are significant only for RUNNING.
    pub fn significantly_differs_from(&self, other: &Link) -> bool {
        self.kind != other.kind
            || self.if_type != other.if_type
            || self.family != other.family
            || self.is_running() != other.is_running()
            || self.master_ifindex != other.master_ifindex
            || self.bond_mode != other.bond_mode
            || self.active_slave_ifindex != other.active_slave_ifindex
            || self.is_slave != other.is_slave
            || self.vlan_id != other.vlan_id
            || self.name != other.name
            || self.phc_index != other.phc_index
    }
}

/// What happened to a row between two published versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
    Change,
}

/// An ordered, versioned, immutable snapshot of the link set.
///
/// Rows are sorted by interface index. Consumers hold the table only for the
/// duration of processing one version and then release it.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    pub version: u64,
    rows: Vec<Link>,
}

impl LinkTable {
    pub fn new(version: u64, mut rows: Vec<Link>) -> Self {
        rows.sort_by_key(|l| l.ifindex);
        Self { version, rows }
    }

    pub fn rows(&self) -> &[Link] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn by_index(&self, ifindex: i32) -> Option<&Link> {
        self.rows.iter().find(|l| l.ifindex == ifindex)
    }

    pub fn by_name(&self, name: &str) -> Option<&Link> {
        self.rows.iter().find(|l| l.name == name)
    }

    /// Slaves of an aggregate interface, in index order.
    pub fn slaves_of(&self, master: i32) -> Vec<&Link> {
        self.rows
            .iter()
            .filter(|l| l.master_ifindex == master)
            .collect()
    }

    /// Row-by-row comparison against the previous version, yielding the
    /// events a consumer would care about. Empty means not worth publishing.
    pub fn diff(&self, prev: &LinkTable) -> Vec<(i32, LinkEvent)> {
        let mut events = Vec::new();
        for row in &self.rows {
            match prev.by_index(row.ifindex) {
                None => events.push((row.ifindex, LinkEvent::Up)),
                Some(old) => {
                    if row.significantly_differs_from(old) {
                        events.push((row.ifindex, LinkEvent::Change));
                    }
                }
            }
        }
        for old in &prev.rows {
            if self.by_index(old.ifindex).is_none() {
                events.push((old.ifindex, LinkEvent::Down));
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(idx: i32, name: &str) -> Link {
        Link::new(idx, name)
    }

    #[test]
    fn test_rows_sorted_by_ifindex() {
        let t = LinkTable::new(1, vec![link(3, "c"), link(1, "a"), link(2, "b")]);
        let idx: Vec<i32> = t.rows().iter().map(|l| l.ifindex).collect();
        assert_eq!(idx, vec![1, 2, 3]);
    }

    #[test]
    fn test_diff_detects_insert_delete_change() {
        let prev = LinkTable::new(1, vec![link(1, "eth0"), link(2, "eth1")]);
        let mut changed = link(1, "eth0");
        changed.phc_index = 4;
        let next = LinkTable::new(2, vec![changed, link(3, "eth2")]);

        let events = next.diff(&prev);
        assert!(events.contains(&(1, LinkEvent::Change)));
        assert!(events.contains(&(3, LinkEvent::Up)));
        assert!(events.contains(&(2, LinkEvent::Down)));
    }

    #[test]
    fn test_only_running_flag_is_significant() {
        let mut a = link(1, "eth0");
        let mut b = link(1, "eth0");
        // A non-RUNNING flag difference is not significant.
        b.flags = libc::IFF_MULTICAST as u32;
        assert!(!b.significantly_differs_from(&a));
        a.flags = libc::IFF_RUNNING as u32;
        assert!(b.significantly_differs_from(&a));
    }

    #[test]
    fn test_identical_tables_diff_empty() {
        let rows = vec![link(1, "eth0"), link(2, "eth1")];
        let a = LinkTable::new(1, rows.clone());
        let b = LinkTable::new(2, rows);
        assert!(b.diff(&a).is_empty());
    }
}
