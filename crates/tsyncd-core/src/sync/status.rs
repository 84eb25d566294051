//! The status surface every sync instance reports.

use std::sync::Arc;

use bitflags::bitflags;

use crate::clocks::{Clock, HwId};
use crate::config::ModuleKind;

bitflags! {
    /// Alarm bits a sync instance can raise. Any set bit disqualifies the
    /// instance from primary selection until the relaxed passes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Alarm: u32 {
        const NO_TX_TIMESTAMPS = 1 << 0;
        const NO_RX_TIMESTAMPS = 1 << 1;
        const NO_SYNC_PKTS = 1 << 2;
        const NO_FOLLOW_UPS = 1 << 3;
        const NO_DELAY_RESPS = 1 << 4;
        const NO_PDELAY_RESPS = 1 << 5;
        const NO_PDELAY_RESP_FOLLOW_UPS = 1 << 6;
        /// PPS input lost its pulse train.
        const NO_PPS_SIGNAL = 1 << 7;
        /// The NTP helper daemon stopped answering.
        const HELPER_UNREACHABLE = 1 << 8;
        /// The bound interface disappeared from the link table.
        const INTERFACE_GONE = 1 << 9;
    }
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (name, flag) in [
            ("no-tx-timestamps", Alarm::NO_TX_TIMESTAMPS),
            ("no-rx-timestamps", Alarm::NO_RX_TIMESTAMPS),
            ("no-sync-pkts", Alarm::NO_SYNC_PKTS),
            ("no-follow-ups", Alarm::NO_FOLLOW_UPS),
            ("no-delay-resps", Alarm::NO_DELAY_RESPS),
            ("no-pdelay-resps", Alarm::NO_PDELAY_RESPS),
            ("no-pdelay-resp-follow-ups", Alarm::NO_PDELAY_RESP_FOLLOW_UPS),
            ("no-pps-signal", Alarm::NO_PPS_SIGNAL),
            ("helper-unreachable", Alarm::HELPER_UNREACHABLE),
            ("interface-gone", Alarm::INTERFACE_GONE),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

bitflags! {
    /// Control flags the engine drives into instances.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u32 {
        /// Keep receiving and processing timestamps.
        const TIMESTAMP_PROCESSING = 1 << 0;
        /// This instance is elected and may adjust its clock.
        const CLOCK_CONTROL_ENABLED = 1 << 1;
        /// A leap second is imminent: defer timestamp processing and clock
        /// updates until cleared.
        const LEAP_SECOND_GUARD = 1 << 2;
    }
}

impl std::fmt::Display for ControlFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (name, flag) in [
            ("timestamp-processing", ControlFlags::TIMESTAMP_PROCESSING),
            ("clock-control", ControlFlags::CLOCK_CONTROL_ENABLED),
            ("leap-second-guard", ControlFlags::LEAP_SECOND_GUARD),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Protocol state of a sync instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Listening,
    Passive,
    Master,
    Slave,
    Faulty,
    Disabled,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening => write!(f, "listening"),
            Self::Passive => write!(f, "passive"),
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
            Self::Faulty => write!(f, "faulty"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Quality descriptor of the grandmaster an instance is following (or of the
/// local reference it presents as one).
#[derive(Debug, Clone, PartialEq)]
pub struct GrandmasterInfo {
    pub clock_id: HwId,
    /// IEEE 1588 clockClass; lower is better.
    pub clock_class: u8,
    /// IEEE 1588 timeSource enumeration value.
    pub time_source: u8,
    /// Accuracy in ns; infinity when unknown.
    pub accuracy_ns: f64,
    /// offsetScaledLogVariance.
    pub variance: u16,
    pub steps_removed: u16,
    pub time_traceable: bool,
    pub freq_traceable: bool,
}

impl Default for GrandmasterInfo {
    fn default() -> Self {
        Self {
            clock_id: HwId::SYSTEM,
            clock_class: 255,
            time_source: 0xa0, // internal oscillator
            accuracy_ns: f64::INFINITY,
            variance: 0xffff,
            steps_removed: 0,
            time_traceable: false,
            freq_traceable: false,
        }
    }
}

/// One instance's full status, polled by the engine each selection tick.
#[derive(Debug, Clone)]
pub struct SyncInstanceStatus {
    pub name: String,
    pub module: ModuleKind,
    pub state: SyncState,
    pub alarms: Alarm,
    /// The local clock this instance disciplines.
    pub clock: Option<Arc<Clock>>,
    /// Current offset from the reference, ns.
    pub offset_from_master_ns: f64,
    /// Timestamp of the last offset measurement, monotonic clock.
    pub last_measurement: Option<crate::time::TimeSpec>,
    /// Configured priority; smaller is stronger.
    pub user_priority: u8,
    pub grandmaster: GrandmasterInfo,
    /// Accuracy this instance can deliver locally, ns.
    pub local_accuracy_ns: f64,
    pub control: ControlFlags,
    /// Pending leap-second indication learned from the reference.
    pub leap59: bool,
    pub leap61: bool,
}

impl SyncInstanceStatus {
    pub fn new(name: &str, module: ModuleKind, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            module,
            state: SyncState::Listening,
            alarms: Alarm::empty(),
            clock: None,
            offset_from_master_ns: 0.0,
            last_measurement: None,
            user_priority: priority,
            grandmaster: GrandmasterInfo::default(),
            local_accuracy_ns: f64::INFINITY,
            control: ControlFlags::TIMESTAMP_PROCESSING,
            leap59: false,
            leap61: false,
        }
    }

    /// True when this instance is a viable primary candidate.
    pub fn is_clean_slave(&self) -> bool {
        self.state == SyncState::Slave && self.alarms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_display_lists_set_bits() {
        let a = Alarm::NO_FOLLOW_UPS | Alarm::NO_TX_TIMESTAMPS;
        assert_eq!(a.to_string(), "no-tx-timestamps,no-follow-ups");
        assert_eq!(Alarm::empty().to_string(), "none");
    }

    #[test]
    fn test_control_flags_display() {
        let c = ControlFlags::TIMESTAMP_PROCESSING | ControlFlags::CLOCK_CONTROL_ENABLED;
        assert_eq!(c.to_string(), "timestamp-processing,clock-control");
    }

    #[test]
    fn test_clean_slave_requires_no_alarms() {
        let mut s = SyncInstanceStatus::new("a", ModuleKind::Freerun, 128);
        assert!(!s.is_clean_slave());
        s.state = SyncState::Slave;
        assert!(s.is_clean_slave());
        s.alarms = Alarm::NO_SYNC_PKTS;
        assert!(!s.is_clean_slave());
    }
}
