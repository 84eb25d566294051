//! Thread event objects.
//!
//! An event is a wakeup channel into a thread's reactor with no payload.
//! The owning thread creates it and receives `on_event` callbacks; any number
//! of [`EventWriter`] clones may post from other threads. Posts accumulate:
//! however many arrive while the owner is busy, it wakes once per burst.

use std::sync::Arc;

use crate::error::Result;
use crate::runtime::fd::EventFd;

/// Event identifier, unique per owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event{}", self.0)
    }
}

pub(crate) struct Event {
    pub id: EventId,
    pub fd: Arc<EventFd>,
}

impl Event {
    pub fn new(id: EventId) -> Result<(Self, EventWriter)> {
        let fd = Arc::new(EventFd::new()?);
        Ok((
            Self {
                id,
                fd: Arc::clone(&fd),
            },
            EventWriter { id, fd },
        ))
    }
}

/// Cloneable, thread-safe posting handle for one thread event.
#[derive(Clone)]
pub struct EventWriter {
    id: EventId,
    fd: Arc<EventFd>,
}

impl EventWriter {
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Post the event. The owning thread wakes exactly once per burst of
    /// accumulated posts.
    pub fn post(&self) -> Result<()> {
        self.fd.post()
    }
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter").field("id", &self.id).finish()
    }
}
