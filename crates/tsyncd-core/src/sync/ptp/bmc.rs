//! Foreign-master tracking and the best-master-clock algorithm.

use std::cmp::Ordering;

use crate::sync::ptp::wire::{AnnounceBody, PortIdentity};
use crate::time::TimeSpec;

/// Announces a source must deliver within the window before it qualifies.
pub const FOREIGN_MASTER_THRESHOLD: u32 = 2;

/// One tracked announce source on a port.
#[derive(Debug, Clone)]
pub struct ForeignMasterRecord {
    pub port_identity: PortIdentity,
    pub announce: AnnounceBody,
    pub last_heard: TimeSpec,
    pub announce_count: u32,
}

impl ForeignMasterRecord {
    pub fn qualified(&self) -> bool {
        self.announce_count >= FOREIGN_MASTER_THRESHOLD
    }
}

/// The dataset key BMCA compares, assembled from an announce.
///
/// Ordering follows IEEE 1588 dataset comparison: priority1, grandmaster
/// class, accuracy, variance, priority2, then grandmaster identity; equal
/// grandmasters tie-break on steps-removed and finally the sender identity.
fn comparison_key(a: &AnnounceBody, sender: &PortIdentity) -> impl Ord {
    (
        a.gm_priority1,
        a.gm_quality.class,
        a.gm_quality.accuracy,
        a.gm_quality.variance,
        a.gm_priority2,
        a.gm_identity,
        a.steps_removed,
        *sender,
    )
}

/// Compare two announce datasets; `Less` means `a` is the better master.
pub fn compare_datasets(
    a: &AnnounceBody,
    a_sender: &PortIdentity,
    b: &AnnounceBody,
    b_sender: &PortIdentity,
) -> Ordering {
    comparison_key(a, a_sender).cmp(&comparison_key(b, b_sender))
}

/// Bounded per-port set of foreign masters.
pub struct ForeignMasterSet {
    cap: usize,
    records: Vec<ForeignMasterRecord>,
}

impl ForeignMasterSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ForeignMasterRecord] {
        &self.records
    }

    /// Ingest one announce. At capacity, the least recently heard record
    /// older than `timeout` is evicted to make room; if none is stale the
    /// announce is dropped.
    pub fn ingest(
        &mut self,
        sender: PortIdentity,
        announce: AnnounceBody,
        now: TimeSpec,
        timeout: TimeSpec,
    ) -> bool {
        if let Some(rec) = self
            .records
            .iter_mut()
            .find(|r| r.port_identity == sender)
        {
            rec.announce = announce;
            rec.last_heard = now;
            rec.announce_count = rec.announce_count.saturating_add(1);
            return true;
        }
        if self.records.len() >= self.cap {
            let cutoff = now - timeout;
            let evict = self
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.last_heard < cutoff)
                .min_by_key(|(_, r)| r.last_heard)
                .map(|(i, _)| i);
            match evict {
                Some(i) => {
                    let gone = self.records.swap_remove(i);
                    log::debug!(
                        "foreign master {} evicted (LRU, stale)",
                        gone.port_identity
                    );
                }
                None => {
                    log::debug!("foreign master set full, dropping {sender}");
                    return false;
                }
            }
        }
        self.records.push(ForeignMasterRecord {
            port_identity: sender,
            announce,
            last_heard: now,
            announce_count: 1,
        });
        true
    }

    /// Drop every record not heard from within `timeout`.
    pub fn expire(&mut self, now: TimeSpec, timeout: TimeSpec) -> usize {
        let cutoff = now - timeout;
        let before = self.records.len();
        self.records.retain(|r| r.last_heard >= cutoff);
        before - self.records.len()
    }

    /// The best qualified foreign master, by dataset comparison.
    pub fn best(&self) -> Option<&ForeignMasterRecord> {
        self.records
            .iter()
            .filter(|r| r.qualified())
            .min_by(|x, y| {
                compare_datasets(
                    &x.announce,
                    &x.port_identity,
                    &y.announce,
                    &y.port_identity,
                )
            })
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ptp::wire::ClockQuality;

    fn sender(n: u8) -> PortIdentity {
        PortIdentity {
            clock_id: [n; 8],
            port: 1,
        }
    }

    fn announce(priority1: u8, class: u8, steps: u16) -> AnnounceBody {
        AnnounceBody {
            gm_priority1: priority1,
            gm_quality: ClockQuality {
                class,
                accuracy: 0x21,
                variance: 0xffff,
            },
            gm_priority2: 128,
            gm_identity: [priority1; 8],
            steps_removed: steps,
            ..Default::default()
        }
    }

    fn ts(sec: i64) -> TimeSpec {
        TimeSpec::new(sec, 0)
    }

    const TIMEOUT: TimeSpec = TimeSpec { sec: 6, nsec: 0 };

    #[test]
    fn test_qualification_needs_repeat_announces() {
        let mut set = ForeignMasterSet::new(4);
        set.ingest(sender(1), announce(128, 6, 1), ts(0), TIMEOUT);
        assert!(set.best().is_none());
        set.ingest(sender(1), announce(128, 6, 1), ts(1), TIMEOUT);
        assert!(set.best().is_some());
    }

    #[test]
    fn test_best_prefers_lower_priority_then_class() {
        let mut set = ForeignMasterSet::new(4);
        for t in 0..2 {
            set.ingest(sender(1), announce(128, 6, 1), ts(t), TIMEOUT);
            set.ingest(sender(2), announce(64, 248, 1), ts(t), TIMEOUT);
            set.ingest(sender(3), announce(64, 6, 1), ts(t), TIMEOUT);
        }
        let best = set.best().unwrap();
        assert_eq!(best.port_identity, sender(3));
    }

    #[test]
    fn test_steps_removed_breaks_equal_grandmasters() {
        let mut set = ForeignMasterSet::new(4);
        let mut near = announce(128, 6, 2);
        let mut far = announce(128, 6, 5);
        // Same grandmaster seen through two paths.
        near.gm_identity = [9; 8];
        far.gm_identity = [9; 8];
        for t in 0..2 {
            set.ingest(sender(1), far, ts(t), TIMEOUT);
            set.ingest(sender(2), near, ts(t), TIMEOUT);
        }
        assert_eq!(set.best().unwrap().port_identity, sender(2));
    }

    #[test]
    fn test_lru_eviction_only_of_stale_records() {
        let mut set = ForeignMasterSet::new(2);
        set.ingest(sender(1), announce(128, 6, 1), ts(0), TIMEOUT);
        set.ingest(sender(2), announce(128, 6, 1), ts(1), TIMEOUT);
        // Both fresh: a third source is dropped.
        assert!(!set.ingest(sender(3), announce(1, 6, 1), ts(2), TIMEOUT));
        assert_eq!(set.len(), 2);
        // Later, sender 1 has gone stale and is the LRU victim.
        assert!(set.ingest(sender(3), announce(1, 6, 1), ts(20), TIMEOUT));
        assert!(set
            .records()
            .iter()
            .all(|r| r.port_identity != sender(1)));
    }

    #[test]
    fn test_expire_removes_silent_sources() {
        let mut set = ForeignMasterSet::new(4);
        set.ingest(sender(1), announce(128, 6, 1), ts(0), TIMEOUT);
        set.ingest(sender(2), announce(128, 6, 1), ts(8), TIMEOUT);
        assert_eq!(set.expire(ts(10), TIMEOUT), 1);
        assert_eq!(set.len(), 1);
    }
}
