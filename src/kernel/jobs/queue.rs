//! Queue Manager (component D).
//!
//! Owns the only hot contention point in the system: `N` per-node FIFOs and
//! their cumulative-load counters, serialized under a single mutex. All
//! operations are O(N) or smaller and never block on I/O.

use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

/// Per-node queue + load, guarded together so an `assign` never observes a
/// half-updated pair.
struct QueueState {
    queues: Vec<Vec<Uuid>>,
    load: Vec<i64>,
}

pub struct QueueManager {
    state: Mutex<QueueState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub node_id: usize,
    pub length: usize,
    pub total_wait: i64,
    pub job_ids: Vec<Uuid>,
}

impl QueueManager {
    pub fn new(node_count: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queues: vec![Vec::new(); node_count],
                load: vec![0; node_count],
            }),
        }
    }

    /// Place `job_id` on the least-loaded node, ties broken by lowest index
    /// (§4.D, §8 invariant 4). Returns the chosen node id.
    pub fn assign(&self, job_id: Uuid, expected_time: i64) -> usize {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let node_id = state
            .load
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(idx, _)| idx)
            .expect("node pool is non-empty");

        state.queues[node_id].push(job_id);
        state.load[node_id] += expected_time;
        node_id
    }

    /// Pop the head of `node_id`'s queue, if any. Does not touch load — see
    /// module docs and §4.D: load is released only by `complete`.
    pub fn dequeue(&self, node_id: usize) -> Option<Uuid> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let queue = state.queues.get_mut(node_id)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Remove `job_id` from `node_id`'s queue (used by cancellation of
    /// still-pending jobs). Returns whether it was found.
    pub fn remove(&self, job_id: Uuid, node_id: usize, expected_time: i64) -> bool {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let Some(queue) = state.queues.get_mut(node_id) else {
            return false;
        };
        if let Some(pos) = queue.iter().position(|id| *id == job_id) {
            queue.remove(pos);
            state.load[node_id] = (state.load[node_id] - expected_time).max(0);
            true
        } else {
            false
        }
    }

    /// Release load for a job that actually ran to completion. Must not be
    /// called for queued-cancellations — those go through `remove` so load
    /// is decremented exactly once (see the open question resolved in
    /// the design notes).
    pub fn complete(&self, node_id: usize, expected_time: i64) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if let Some(load) = state.load.get_mut(node_id) {
            *load = (*load - expected_time).max(0);
        }
    }

    /// 0-indexed position of `job_id` within `node_id`'s queue, if present.
    pub fn position(&self, job_id: Uuid, node_id: usize) -> Option<usize> {
        let state = self.state.lock().expect("queue mutex poisoned");
        state.queues.get(node_id)?.iter().position(|id| *id == job_id)
    }

    pub fn stats(&self) -> Vec<NodeStats> {
        let state = self.state.lock().expect("queue mutex poisoned");
        state
            .queues
            .iter()
            .zip(state.load.iter())
            .enumerate()
            .map(|(node_id, (queue, load))| NodeStats {
                node_id,
                length: queue.len(),
                total_wait: *load,
                job_ids: queue.clone(),
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_to_empty_cluster_in_index_order() {
        let q = QueueManager::new(8);
        for expected in 0..8 {
            let job = Uuid::new_v4();
            let node = q.assign(job, 10);
            assert_eq!(node, expected);
        }
    }

    #[test]
    fn placement_picks_min_load_leftmost_on_tie() {
        let q = QueueManager::new(8);
        {
            let mut state = q.state.lock().unwrap();
            state.load = vec![30, 10, 20, 0, 0, 0, 0, 0];
        }
        let job = Uuid::new_v4();
        let node = q.assign(job, 5);
        assert_eq!(node, 3);
        assert_eq!(q.state.lock().unwrap().load[3], 5);
    }

    #[test]
    fn fifo_within_a_node() {
        let q = QueueManager::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.assign(a, 1);
        q.assign(b, 1);
        assert_eq!(q.dequeue(0), Some(a));
        assert_eq!(q.dequeue(0), Some(b));
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn dequeue_does_not_release_load() {
        let q = QueueManager::new(1);
        let job = Uuid::new_v4();
        q.assign(job, 42);
        q.dequeue(0);
        assert_eq!(q.stats()[0].total_wait, 42);
    }

    #[test]
    fn complete_releases_load_clamped_at_zero() {
        let q = QueueManager::new(1);
        let job = Uuid::new_v4();
        q.assign(job, 10);
        q.dequeue(0);
        q.complete(0, 10);
        assert_eq!(q.stats()[0].total_wait, 0);
        q.complete(0, 5);
        assert_eq!(q.stats()[0].total_wait, 0);
    }

    #[test]
    fn remove_finds_and_subtracts_load_once() {
        let q = QueueManager::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.assign(a, 10);
        q.assign(b, 20);
        assert!(q.remove(a, 0, 10));
        assert_eq!(q.stats()[0].total_wait, 20);
        assert_eq!(q.stats()[0].job_ids, vec![b]);
        // removing again is a no-op: already gone
        assert!(!q.remove(a, 0, 10));
    }

    #[test]
    fn position_reports_0_indexed_offset() {
        let q = QueueManager::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.assign(a, 1);
        q.assign(b, 1);
        assert_eq!(q.position(a, 0), Some(0));
        assert_eq!(q.position(b, 0), Some(1));
        assert_eq!(q.position(Uuid::new_v4(), 0), None);
    }
}
