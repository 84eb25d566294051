//! Reference-counted ring of published link-table versions.
//!
//! The most recent four versions are retained. A slot becomes reusable only
//! when every consumer of its version has released it; attempting to publish
//! while the oldest slot is still referenced fails with try-again and the
//! publisher re-services once a release frees the slot.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::link::LinkTable;
use crate::runtime::event::EventWriter;

/// Retained version depth.
pub const RING_DEPTH: usize = 4;

struct Slot {
    table: std::sync::Arc<LinkTable>,
    refs: usize,
}

#[derive(Default)]
struct RingInner {
    slots: Vec<Option<Slot>>,
    /// Next slot to write.
    head: usize,
    last_version: u64,
    /// Posted when a release frees a slot so a blocked publisher re-services.
    release_notify: Option<EventWriter>,
}

/// The shared set of published link tables.
pub struct LinkTableSet {
    inner: Mutex<RingInner>,
}

impl LinkTableSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                slots: (0..RING_DEPTH).map(|_| None).collect(),
                head: 0,
                last_version: 0,
                release_notify: None,
            }),
        }
    }

    /// Register the publisher's re-service event.
    pub fn set_release_notify(&self, writer: EventWriter) {
        self.inner.lock().unwrap().release_notify = Some(writer);
    }

    /// Publish `rows` as the next version, committing `consumers` as the
    /// initial reference count. Returns the version number, or
    /// [`Error::TryAgain`] when the ring head still has live references.
    pub fn publish(&self, rows: Vec<crate::link::Link>, consumers: usize) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.head;
        if let Some(slot) = &inner.slots[head] {
            if slot.refs > 0 {
                log::debug!(
                    "link table ring full: v{} still has {} references",
                    slot.table.version,
                    slot.refs
                );
                return Err(Error::TryAgain("link table ring head referenced"));
            }
        }
        let version = inner.last_version + 1;
        let table = std::sync::Arc::new(LinkTable::new(version, rows));
        inner.slots[head] = Some(Slot {
            table,
            refs: consumers,
        });
        inner.head = (head + 1) % RING_DEPTH;
        inner.last_version = version;
        Ok(version)
    }

    /// Borrow a published version. The caller must already hold a reference
    /// (committed at publish time) and must release it exactly once.
    pub fn get(&self, version: u64) -> Option<std::sync::Arc<LinkTable>> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .flatten()
            .find(|s| s.table.version == version)
            .map(|s| std::sync::Arc::clone(&s.table))
    }

    /// The newest published version, without touching reference counts.
    pub fn latest_version(&self) -> u64 {
        self.inner.lock().unwrap().last_version
    }

    /// Drop one consumer reference from `version`. Underflow is an invariant
    /// violation and fatal to the caller.
    pub fn release(&self, version: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .iter_mut()
            .flatten()
            .find(|s| s.table.version == version)
            .ok_or(Error::RefcountUnderflow(version))?;
        if slot.refs == 0 {
            return Err(Error::RefcountUnderflow(version));
        }
        slot.refs -= 1;
        let freed = slot.refs == 0;
        if freed {
            if let Some(w) = &inner.release_notify {
                let _ = w.post();
            }
        }
        Ok(())
    }

    /// Live reference count of a version, for diagnostics and tests.
    pub fn refcount(&self, version: u64) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .flatten()
            .find(|s| s.table.version == version)
            .map(|s| s.refs)
    }
}

impl Default for LinkTableSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;

    fn rows() -> Vec<Link> {
        vec![Link::new(1, "eth0")]
    }

    #[test]
    fn test_versions_monotonic() {
        let ring = LinkTableSet::new();
        let v1 = ring.publish(rows(), 0).unwrap();
        let v2 = ring.publish(rows(), 0).unwrap();
        assert!(v2 > v1);
    }

    #[test]
    fn test_refcount_lifecycle() {
        let ring = LinkTableSet::new();
        let v = ring.publish(rows(), 3).unwrap();
        assert_eq!(ring.refcount(v), Some(3));
        ring.release(v).unwrap();
        ring.release(v).unwrap();
        assert_eq!(ring.refcount(v), Some(1));
        ring.release(v).unwrap();
        assert_eq!(ring.refcount(v), Some(0));
        // A fourth release underflows.
        assert!(matches!(
            ring.release(v),
            Err(Error::RefcountUnderflow(_))
        ));
    }

    #[test]
    fn test_full_ring_returns_try_again() {
        let ring = LinkTableSet::new();
        // Fill all four slots with one live reference each.
        let versions: Vec<u64> = (0..RING_DEPTH)
            .map(|_| ring.publish(rows(), 1).unwrap())
            .collect();
        let err = ring.publish(rows(), 1).unwrap_err();
        assert!(matches!(err, Error::TryAgain(_)));

        // Releasing the head slot unblocks exactly one publish.
        ring.release(versions[0]).unwrap();
        assert!(ring.publish(rows(), 1).is_ok());
        assert!(matches!(ring.publish(rows(), 1), Err(Error::TryAgain(_))));
    }

    #[test]
    fn test_publish_succeeds_while_newer_versions_held() {
        let ring = LinkTableSet::new();
        let v1 = ring.publish(rows(), 3).unwrap();
        ring.release(v1).unwrap();
        ring.release(v1).unwrap();
        // v1 still has one reference but is not the ring head for the next
        // publishes until wraparound.
        assert!(ring.publish(rows(), 0).is_ok());
        assert!(ring.publish(rows(), 0).is_ok());
        assert!(ring.publish(rows(), 0).is_ok());
        // Wrapped back to v1's slot, which is still referenced.
        assert!(matches!(ring.publish(rows(), 0), Err(Error::TryAgain(_))));
        ring.release(v1).unwrap();
        assert!(ring.publish(rows(), 0).is_ok());
    }
}
