//! Per-source reorder buffer

use std::collections::{BTreeMap, HashMap};

use crate::ids::{ParticipationId, SequenceNumber};

use super::SyncError;

/// Outcome of offering one item to the sequencer.
#[derive(Debug, PartialEq)]
pub enum Admission<T> {
    /// The item closed the gap; these are ready, in ascending order.
    Ready(Vec<T>),
    /// Held until the missing numbers arrive.
    Buffered,
    /// Already applied or already buffered.
    Duplicate,
}

#[derive(Debug)]
struct Source<T> {
    next: SequenceNumber,
    buffer: BTreeMap<SequenceNumber, T>,
}

impl<T> Default for Source<T> {
    fn default() -> Self {
        Self {
            next: 0,
            buffer: BTreeMap::new(),
        }
    }
}

/// Applies items from each source in sequence order, starting at 0.
#[derive(Debug)]
pub struct Sequencer<T> {
    capacity: usize,
    sources: HashMap<ParticipationId, Source<T>>,
}

impl<T> Sequencer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sources: HashMap::new(),
        }
    }

    pub fn admit(
        &mut self,
        source: &ParticipationId,
        sequence: SequenceNumber,
        item: T,
    ) -> Result<Admission<T>, SyncError> {
        let capacity = self.capacity;
        let state = self.sources.entry(source.clone()).or_default();

        if sequence < state.next || state.buffer.contains_key(&sequence) {
            return Ok(Admission::Duplicate);
        }
        if sequence > state.next {
            if state.buffer.len() >= capacity {
                return Err(SyncError::ReorderBufferFull {
                    peer: source.clone(),
                    capacity,
                });
            }
            state.buffer.insert(sequence, item);
            return Ok(Admission::Buffered);
        }

        let mut ready = vec![item];
        state.next += 1;
        while let Some(next) = state.buffer.remove(&state.next) {
            ready.push(next);
            state.next += 1;
        }
        Ok(Admission::Ready(ready))
    }

    /// The number the next applied item from `source` must carry.
    pub fn next_expected(&self, source: &ParticipationId) -> SequenceNumber {
        self.sources.get(source).map_or(0, |s| s.next)
    }

    /// Skip ahead, e.g. after bootstrapping from a snapshot. Buffered items
    /// below `next` are discarded; any that become contiguous are returned.
    pub fn resume_at(&mut self, source: &ParticipationId, next: SequenceNumber) -> Vec<T> {
        let state = self.sources.entry(source.clone()).or_default();
        if next <= state.next {
            return Vec::new();
        }
        state.next = next;
        state.buffer = state.buffer.split_off(&next);
        let mut ready = Vec::new();
        while let Some(item) = state.buffer.remove(&state.next) {
            ready.push(item);
            state.next += 1;
        }
        ready
    }

    /// Items from `source` waiting for a gap to close.
    pub fn pending(&self, source: &ParticipationId) -> usize {
        self.sources.get(source).map_or(0, |s| s.buffer.len())
    }

    /// The lowest missing number from `source`, if anything is buffered.
    pub fn gap(&self, source: &ParticipationId) -> Option<SequenceNumber> {
        self.sources
            .get(source)
            .filter(|s| !s.buffer.is_empty())
            .map(|s| s.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> ParticipationId {
        "repo".into()
    }

    #[test]
    fn test_out_of_order_is_released_in_order() {
        let mut seq = Sequencer::new(16);
        assert_eq!(seq.admit(&repo(), 1, "b").unwrap(), Admission::Buffered);
        assert_eq!(seq.admit(&repo(), 2, "c").unwrap(), Admission::Buffered);
        assert_eq!(seq.pending(&repo()), 2);
        assert_eq!(seq.gap(&repo()), Some(0));

        assert_eq!(
            seq.admit(&repo(), 0, "a").unwrap(),
            Admission::Ready(vec!["a", "b", "c"])
        );
        assert_eq!(seq.next_expected(&repo()), 3);
        assert_eq!(seq.pending(&repo()), 0);
        assert_eq!(seq.gap(&repo()), None);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut seq = Sequencer::new(16);
        seq.admit(&repo(), 0, "a").unwrap();
        assert_eq!(seq.admit(&repo(), 0, "a").unwrap(), Admission::Duplicate);

        seq.admit(&repo(), 5, "f").unwrap();
        assert_eq!(seq.admit(&repo(), 5, "f").unwrap(), Admission::Duplicate);
    }

    #[test]
    fn test_sources_are_independent() {
        let mut seq = Sequencer::new(16);
        seq.admit(&repo(), 0, 1).unwrap();
        assert_eq!(
            seq.admit(&"other".into(), 0, 2).unwrap(),
            Admission::Ready(vec![2])
        );
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut seq = Sequencer::new(2);
        seq.admit(&repo(), 1, ()).unwrap();
        seq.admit(&repo(), 2, ()).unwrap();
        assert!(matches!(
            seq.admit(&repo(), 3, ()),
            Err(SyncError::ReorderBufferFull { capacity: 2, .. })
        ));
        // the expected one still goes through
        assert!(matches!(seq.admit(&repo(), 0, ()), Ok(Admission::Ready(v)) if v.len() == 3));
    }

    #[test]
    fn test_resume_skips_ahead() {
        let mut seq = Sequencer::new(16);
        seq.admit(&repo(), 3, "old").unwrap();
        seq.admit(&repo(), 6, "g").unwrap();
        assert!(seq.resume_at(&repo(), 5).is_empty());
        assert_eq!(seq.pending(&repo()), 1);
        assert_eq!(
            seq.admit(&repo(), 5, "f").unwrap(),
            Admission::Ready(vec!["f", "g"])
        );
    }
}
