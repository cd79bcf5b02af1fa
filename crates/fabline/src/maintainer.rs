//! The maintainer: a finite pool of repair technicians and the policy that
//! decides which queued machine is repaired next.
//!
//! Selection is parameterized by a single capability, `choose_next`, so
//! custom dispatch rules compose without subclassing anything: implement
//! [`MaintenancePolicy`] and hand it to the system builder.

use std::fmt;
use std::sync::Arc;

use crate::node::NodeId;
use crate::rng::SimRng;

// ============================================================================
// Policy seam
// ============================================================================

/// A machine waiting for repair, as seen by a selection policy.
#[derive(Debug, Clone)]
pub struct MaintenanceRequest {
    pub machine: NodeId,
    pub name: String,
    /// Tick at which the machine first entered the queue this cycle.
    pub time_entered_queue: u64,
    /// True for corrective requests.
    pub failed: bool,
    pub health: usize,
    /// Mean of the repair distribution that would apply right now.
    pub expected_repair_time: f64,
    pub selection_priority: i32,
}

/// Chooses the next machine to repair from a non-empty queue.
pub trait MaintenancePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks one request. `queue` is never empty when this is called.
    fn choose_next(&self, queue: &[MaintenanceRequest], rng: &mut SimRng) -> NodeId;
}

/// Default policy: first-in-first-out by queue entry time, ties broken
/// uniformly at random.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl MaintenancePolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn choose_next(&self, queue: &[MaintenanceRequest], rng: &mut SimRng) -> NodeId {
        let earliest = queue
            .iter()
            .map(|request| request.time_entered_queue)
            .min()
            .unwrap_or(0);
        let candidates: Vec<&MaintenanceRequest> = queue
            .iter()
            .filter(|request| request.time_entered_queue == earliest)
            .collect();
        candidates[rng.index(candidates.len())].machine
    }
}

/// Alternative policy: repair the machine with the longest expected repair
/// first, so the most expensive job ties up a technician as early as
/// possible.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongestRepairFirst;

impl MaintenancePolicy for LongestRepairFirst {
    fn name(&self) -> &'static str {
        "longest-repair-first"
    }

    fn choose_next(&self, queue: &[MaintenanceRequest], rng: &mut SimRng) -> NodeId {
        let longest = queue
            .iter()
            .map(|request| request.expected_repair_time)
            .fold(f64::NEG_INFINITY, f64::max);
        let candidates: Vec<&MaintenanceRequest> = queue
            .iter()
            .filter(|request| request.expected_repair_time >= longest)
            .collect();
        candidates[rng.index(candidates.len())].machine
    }
}

// ============================================================================
// Maintainer
// ============================================================================

/// Finite-capacity repair dispatcher.
#[derive(Clone)]
pub struct Maintainer {
    /// `None` means an unbounded technician pool.
    capacity: Option<u64>,
    utilization: u64,
    policy: Arc<dyn MaintenancePolicy>,
}

impl Maintainer {
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            capacity,
            utilization: 0,
            policy: Arc::new(FifoPolicy),
        }
    }

    /// Replaces the selection policy.
    pub fn with_policy(mut self, policy: Arc<dyn MaintenancePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    /// Number of repairs currently in progress.
    pub fn utilization(&self) -> u64 {
        self.utilization
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.capacity.is_none_or(|capacity| self.utilization < capacity)
    }

    pub(crate) fn choose(&self, queue: &[MaintenanceRequest], rng: &mut SimRng) -> NodeId {
        self.policy.choose_next(queue, rng)
    }

    pub(crate) fn begin_repair(&mut self) {
        self.utilization += 1;
    }

    pub(crate) fn end_repair(&mut self) {
        debug_assert!(self.utilization > 0, "utilization underflow");
        self.utilization = self.utilization.saturating_sub(1);
    }

    pub(crate) fn reset(&mut self) {
        self.utilization = 0;
    }
}

impl fmt::Debug for Maintainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Maintainer")
            .field("capacity", &self.capacity)
            .field("utilization", &self.utilization)
            .field("policy", &self.policy.name())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(index: usize, entered: u64, expected: f64) -> MaintenanceRequest {
        MaintenanceRequest {
            machine: NodeId::from_index(index),
            name: format!("M{index}"),
            time_entered_queue: entered,
            failed: false,
            health: 3,
            expected_repair_time: expected,
            selection_priority: 0,
        }
    }

    #[test]
    fn fifo_picks_earliest_entry() {
        let mut rng = SimRng::new(0);
        let queue = vec![request(0, 30, 1.0), request(1, 10, 1.0), request(2, 20, 1.0)];
        let chosen = FifoPolicy.choose_next(&queue, &mut rng);
        assert_eq!(chosen, NodeId::from_index(1));
    }

    #[test]
    fn fifo_breaks_ties_over_all_candidates() {
        let mut rng = SimRng::new(42);
        let queue = vec![request(0, 5, 1.0), request(1, 5, 1.0), request(2, 9, 1.0)];
        let mut seen = [false; 3];
        for _ in 0..200 {
            seen[FifoPolicy.choose_next(&queue, &mut rng).index()] = true;
        }
        assert!(seen[0] && seen[1], "both tied machines get picked");
        assert!(!seen[2], "later entry never wins a FIFO tie");
    }

    #[test]
    fn longest_repair_first_prefers_expensive_jobs() {
        let mut rng = SimRng::new(0);
        let queue = vec![request(0, 1, 4.0), request(1, 9, 10.0), request(2, 2, 2.5)];
        let chosen = LongestRepairFirst.choose_next(&queue, &mut rng);
        assert_eq!(chosen, NodeId::from_index(1));
    }

    #[test]
    fn capacity_gates_repairs() {
        let mut maintainer = Maintainer::new(Some(2));
        assert!(maintainer.has_capacity());
        maintainer.begin_repair();
        maintainer.begin_repair();
        assert!(!maintainer.has_capacity());
        maintainer.end_repair();
        assert!(maintainer.has_capacity());
    }

    #[test]
    fn unbounded_pool_never_saturates() {
        let mut maintainer = Maintainer::new(None);
        for _ in 0..1000 {
            assert!(maintainer.has_capacity());
            maintainer.begin_repair();
        }
        assert_eq!(maintainer.utilization(), 1000);
    }
}
