//! Due-time priority queue.
//!
//! Each watch has at most one live entry. Rescheduling pushes a new heap entry
//! and bumps the watch's generation; stale entries are skipped on pop.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

use crate::domain::WatchId;

#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, WatchId)>>,
    live: HashMap<WatchId, u64>,
    generation: u64,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or replaces) the due time of `id`.
    pub fn schedule(&mut self, id: WatchId, at: Instant) {
        self.generation += 1;
        self.live.insert(id, self.generation);
        self.heap.push(Reverse((at, self.generation, id)));
    }

    pub fn remove(&mut self, id: WatchId) -> bool {
        self.live.remove(&id).is_some()
    }

    pub fn contains(&self, id: WatchId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Earliest live due time.
    pub fn next_due(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Removes and returns one watch whose due time is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<WatchId> {
        self.discard_stale();
        let Reverse((at, _, id)) = *self.heap.peek()?;
        if at > now {
            return None;
        }
        self.heap.pop();
        self.live.remove(&id);
        Some(id)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, generation, id))) = self.heap.peek() {
            if self.live.get(id) == Some(generation) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_due_order_and_only_when_due() {
        let t0 = Instant::now();
        let mut q = DueQueue::new();
        q.schedule(WatchId(1), t0 + Duration::from_secs(30));
        q.schedule(WatchId(2), t0 + Duration::from_secs(10));
        q.schedule(WatchId(3), t0 + Duration::from_secs(20));

        assert_eq!(q.pop_due(t0), None);
        assert_eq!(q.next_due(), Some(t0 + Duration::from_secs(10)));

        let later = t0 + Duration::from_secs(25);
        assert_eq!(q.pop_due(later), Some(WatchId(2)));
        assert_eq!(q.pop_due(later), Some(WatchId(3)));
        assert_eq!(q.pop_due(later), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reschedule_replaces_previous_entry() {
        let t0 = Instant::now();
        let mut q = DueQueue::new();
        q.schedule(WatchId(1), t0);
        q.schedule(WatchId(1), t0 + Duration::from_secs(60));

        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_due(t0), None);
        assert_eq!(q.next_due(), Some(t0 + Duration::from_secs(60)));
        assert_eq!(
            q.pop_due(t0 + Duration::from_secs(60)),
            Some(WatchId(1))
        );
        assert!(q.is_empty());
    }

    #[test]
    fn removed_watch_never_pops() {
        let t0 = Instant::now();
        let mut q = DueQueue::new();
        q.schedule(WatchId(1), t0);
        q.schedule(WatchId(2), t0);
        assert!(q.remove(WatchId(1)));
        assert!(!q.contains(WatchId(1)));

        assert_eq!(q.pop_due(t0), Some(WatchId(2)));
        assert_eq!(q.pop_due(t0), None);
        assert_eq!(q.next_due(), None);
    }
}
