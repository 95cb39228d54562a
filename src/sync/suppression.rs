//! Scoped echo suppression

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::trace;

use crate::ids::{EventId, EventIdSource};

/// Event ids currently being applied from a peer.
///
/// Shared between the apply path, which marks ids, and the outbound echo
/// filter, which drops local events carrying a marked id.
#[derive(Clone, Default)]
pub struct SuppressionSet {
    // id -> nesting depth
    marks: Rc<RefCell<HashMap<EventId, usize>>>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.marks.borrow().contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.marks.borrow().is_empty()
    }

    /// Mark `id` as in flight and pin it on `event_ids` until the guard drops.
    pub fn enter(&self, id: EventId, event_ids: &Rc<EventIdSource>) -> SuppressionGuard {
        trace!("suppressing echoes of {}", id);
        *self.marks.borrow_mut().entry(id.clone()).or_insert(0) += 1;
        event_ids.pin(id.clone());
        SuppressionGuard {
            set: self.clone(),
            id,
            event_ids: Rc::clone(event_ids),
        }
    }

    fn leave(&self, id: &EventId) {
        let mut marks = self.marks.borrow_mut();
        if let Some(depth) = marks.get_mut(id) {
            *depth -= 1;
            if *depth == 0 {
                marks.remove(id);
            }
        }
    }
}

/// Clears its mark and unpins the event id when dropped, including during
/// unwinding.
pub struct SuppressionGuard {
    set: SuppressionSet,
    id: EventId,
    event_ids: Rc<EventIdSource>,
}

impl SuppressionGuard {
    pub fn id(&self) -> &EventId {
        &self.id
    }
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.set.leave(&self.id);
        self.event_ids.unpin(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_guard_marks_and_pins() {
        let set = SuppressionSet::new();
        let ids = Rc::new(EventIdSource::new("client".into()));
        let remote = EventId::new("repo-evt-4");
        {
            let _guard = set.enter(remote.clone(), &ids);
            assert!(set.contains(&remote));
            assert_eq!(ids.next_id(), remote);
        }
        assert!(set.is_empty());
        assert!(!ids.is_pinned());
    }

    #[test]
    fn test_nested_guards_keep_outer_mark() {
        let set = SuppressionSet::new();
        let ids = Rc::new(EventIdSource::new("client".into()));
        let remote = EventId::new("repo-evt-4");

        let outer = set.enter(remote.clone(), &ids);
        drop(set.enter(remote.clone(), &ids));
        assert!(set.contains(&remote));
        assert_eq!(ids.next_id(), remote);
        drop(outer);
        assert!(!set.contains(&remote));
    }

    #[test]
    fn test_mark_is_cleared_on_panic() {
        let set = SuppressionSet::new();
        let ids = Rc::new(EventIdSource::new("client".into()));
        let remote = EventId::new("repo-evt-9");

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = set.enter(remote.clone(), &ids);
            panic!("apply failed");
        }));

        assert!(result.is_err());
        assert!(!set.contains(&remote));
        assert!(!ids.is_pinned());
    }
}
