//! Event sources and the loop-owned registry.
//!
//! An event source is a pluggable producer of events that shares the loop's
//! poll call. The loop owns every registered source; while a source's
//! callback runs, the source is temporarily taken out of its registry slot so
//! the callback can receive `&mut EventLoop` without aliasing. Sources refer
//! to themselves through their `SourceId` (slot index), never through a
//! back-pointer.

use std::any::Any;

use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::poller::{Readiness, SourceId};

/// Discriminator for downcasting a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    ConnectionManager,
    InterruptManager,
}

/// Lifecycle state of an event source.
///
/// Stopping is asynchronous: a source may linger in `Stopping` across several
/// dispatch cycles, and the loop cannot finish its own shutdown until every
/// source has reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Fresh,
    /// Registered but not running.
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Capability set of an event source.
pub trait EventSource: Any {
    /// Unique name within one loop.
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn state(&self) -> SourceState;

    /// Bring the source up. Called by the loop on `EventLoop::start`, or
    /// immediately on registration when the loop is already started. `id` is
    /// the source's registry slot, needed for poller registrations.
    fn start(&mut self, el: &mut EventLoop, id: SourceId) -> Result<(), Error>;

    /// Request shutdown. Asynchronous: the source reports `Stopped` through
    /// `state` once its teardown has finished, possibly several cycles later.
    fn stop(&mut self, el: &mut EventLoop);

    /// Readiness for a descriptor this source registered under `key`.
    fn on_poll_event(&mut self, el: &mut EventLoop, key: usize, ready: Readiness);

    /// Per-cycle housekeeping, called after I/O dispatch.
    fn on_cycle(&mut self, el: &mut EventLoop);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Slot {
    /// Empty string marks a vacant slot.
    name: String,
    /// `None` while the source is taken out for a callback.
    source: Option<Box<dyn EventSource>>,
    pending_remove: bool,
    /// Monotonic registration sequence. Slot indices may be reused after a
    /// deregistration, so registration order is tracked here, not by index.
    seq: u64,
}

/// Named slots owning the registered sources. Slot indices are stable for
/// the lifetime of a registration (vacated slots are reused, never shifted),
/// which is what makes them usable inside poller tokens. Iteration order
/// follows the registration sequence, not the slot index.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    next_seq: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    pub(crate) fn find(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.name.is_empty() && s.name == name)
    }

    pub(crate) fn insert(&mut self, source: Box<dyn EventSource>) -> Result<usize, Error> {
        let name = source.name().to_string();
        if name.is_empty() {
            return Err(Error::InvalidArgument("event source name must be non-empty"));
        }
        if self.find(&name).is_some() {
            return Err(Error::NameConflict);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = Slot {
            name,
            source: Some(source),
            pending_remove: false,
            seq,
        };
        match self.slots.iter().position(|s| s.name.is_empty()) {
            Some(idx) => {
                self.slots[idx] = slot;
                Ok(idx)
            }
            None => {
                self.slots.push(slot);
                Ok(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn take(&mut self, idx: usize) -> Option<Box<dyn EventSource>> {
        self.slots.get_mut(idx)?.source.take()
    }

    pub(crate) fn restore(&mut self, idx: usize, source: Box<dyn EventSource>) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.source = Some(source);
        }
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&dyn EventSource> {
        self.slots.get(idx)?.source.as_deref()
    }

    pub(crate) fn mark_pending_remove(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.pending_remove = true;
        }
    }

    /// Vacate a slot, dropping its source.
    pub(crate) fn vacate(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.name.clear();
            slot.source = None;
            slot.pending_remove = false;
        }
    }

    /// Indices of occupied slots in registration order. A reused slot keeps
    /// its new source's place in the sequence, not the old one's.
    pub(crate) fn occupied(&self) -> Vec<usize> {
        let mut order: Vec<(u64, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.name.is_empty())
            .map(|(i, s)| (s.seq, i))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, i)| i).collect()
    }

    /// Occupied slots whose deregistration is pending and whose source has
    /// finished stopping.
    pub(crate) fn removable(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.pending_remove
                    && s.source
                        .as_ref()
                        .is_some_and(|src| {
                            matches!(src.state(), SourceState::Stopped | SourceState::Fresh)
                        })
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn any_stopping(&self) -> bool {
        self.slots.iter().any(|s| {
            s.source
                .as_ref()
                .is_some_and(|src| src.state() == SourceState::Stopping)
        })
    }

    pub(crate) fn all_stopped(&self) -> bool {
        self.slots.iter().all(|s| {
            s.name.is_empty()
                || s.source
                    .as_ref()
                    .is_none_or(|src| {
                        matches!(src.state(), SourceState::Stopped | SourceState::Fresh)
                    })
        })
    }

    /// Drop every source in reverse registration order.
    pub(crate) fn drain_reverse(&mut self) {
        for idx in self.occupied().into_iter().rev() {
            if let Some(slot) = self.slots.get_mut(idx) {
                slot.source = None;
                slot.name.clear();
            }
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        name: String,
    }

    impl EventSource for Dummy {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> SourceKind {
            SourceKind::ConnectionManager
        }

        fn state(&self) -> SourceState {
            SourceState::Fresh
        }

        fn start(&mut self, _el: &mut EventLoop, _id: SourceId) -> Result<(), Error> {
            Ok(())
        }

        fn stop(&mut self, _el: &mut EventLoop) {}

        fn on_poll_event(&mut self, _el: &mut EventLoop, _key: usize, _ready: Readiness) {}

        fn on_cycle(&mut self, _el: &mut EventLoop) {}

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn src(name: &str) -> Box<dyn EventSource> {
        Box::new(Dummy {
            name: name.to_string(),
        })
    }

    #[test]
    fn duplicate_names_conflict() {
        let mut r = Registry::new();
        r.insert(src("a")).unwrap();
        assert_eq!(r.insert(src("a")).unwrap_err(), Error::NameConflict);
    }

    #[test]
    fn reused_slots_keep_registration_order() {
        let mut r = Registry::new();
        let a = r.insert(src("a")).unwrap();
        let b = r.insert(src("b")).unwrap();
        r.vacate(a);
        // The new source reuses the vacated slot but registers after b.
        let c = r.insert(src("c")).unwrap();
        assert_eq!(c, a);
        assert_eq!(r.occupied(), vec![b, c]);
    }

    #[test]
    fn occupied_is_registration_ordered_without_reuse() {
        let mut r = Registry::new();
        let a = r.insert(src("a")).unwrap();
        let b = r.insert(src("b")).unwrap();
        let c = r.insert(src("c")).unwrap();
        assert_eq!(r.occupied(), vec![a, b, c]);
    }
}
