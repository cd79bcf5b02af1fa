//! Event types and the time-ordered event queue.
//!
//! Simultaneous events execute in a fixed order so that, within one tick,
//! deliveries land before new requests and degradation resolves before the
//! maintainer inspects. The full key is `(time, action rank, user priority,
//! tiebreak, id)`; the tiebreak is a random draw taken from the replication's
//! RNG stream at scheduling time, which keeps runs reproducible seed-for-seed.
//!
//! Cancellation is cooperative and lazy: canceling marks the event and the
//! kernel skips marked events when they reach the head of the queue. Nothing
//! is ever removed from the middle of the heap.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

// ============================================================================
// Action kinds
// ============================================================================

/// The closed set of simulation actions.
///
/// The discriminant order below is also the same-tick tie-break order:
/// end-of-step events (arrivals, deliveries, restores) fire first, health
/// transitions resolve next, and part handoffs go last so machines see the
/// freshest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GenerateArrival,
    RequestSpace,
    PutPart,
    Restore,
    MaintainPlannedFailure,
    Degrade,
    EnterQueue,
    Fail,
    Inspect,
    Maintain,
    RequestPart,
    GetPart,
    Terminate,
}

impl ActionKind {
    /// Same-tick tie-break rank; lower wins.
    pub const fn rank(self) -> u8 {
        match self {
            ActionKind::GenerateArrival => 0,
            ActionKind::RequestSpace => 1,
            ActionKind::PutPart => 2,
            ActionKind::Restore => 3,
            ActionKind::MaintainPlannedFailure => 4,
            ActionKind::Degrade => 5,
            ActionKind::EnterQueue => 6,
            ActionKind::Fail => 7,
            ActionKind::Inspect => 8,
            ActionKind::Maintain => 9,
            ActionKind::RequestPart => 10,
            ActionKind::GetPart => 11,
            ActionKind::Terminate => 12,
        }
    }

    /// Snake-case name used in trace rows.
    pub const fn name(self) -> &'static str {
        match self {
            ActionKind::GenerateArrival => "generate_arrival",
            ActionKind::RequestSpace => "request_space",
            ActionKind::PutPart => "put_part",
            ActionKind::Restore => "restore",
            ActionKind::MaintainPlannedFailure => "maintain_planned_failure",
            ActionKind::Degrade => "degrade",
            ActionKind::EnterQueue => "enter_queue",
            ActionKind::Fail => "fail",
            ActionKind::Inspect => "inspect",
            ActionKind::Maintain => "maintain",
            ActionKind::RequestPart => "request_part",
            ActionKind::GetPart => "get_part",
            ActionKind::Terminate => "terminate",
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Monotonic event identifier, unique within one replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(u64);

impl EventId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where an event lands: a topology node, the maintainer, or the kernel
/// itself. Events reference nodes by identifier, never by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTarget {
    Node(NodeId),
    Maintainer,
    Kernel,
}

/// A scheduled action.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    /// Tick at which the action fires.
    pub time: u64,
    pub target: EventTarget,
    pub action: ActionKind,
    /// Diagnostic tag naming what scheduled this event.
    pub source: String,
    /// User-assigned priority; breaks ties after the action rank.
    pub priority: i32,
    /// Random draw breaking the remaining ties.
    pub tiebreak: u64,
}

impl Event {
    fn key(&self) -> (u64, u8, i32, u64, EventId) {
        (self.time, self.action.rank(), self.priority, self.tiebreak, self.id)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

// ============================================================================
// Event queue
// ============================================================================

/// Priority queue of pending events with lazy cancellation.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    canceled: HashSet<EventId>,
    next_id: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an event and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        time: u64,
        target: EventTarget,
        action: ActionKind,
        source: String,
        priority: i32,
        tiebreak: u64,
    ) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Event {
            id,
            time,
            target,
            action,
            source,
            priority,
            tiebreak,
        }));
        id
    }

    /// Removes and returns the minimum event together with its canceled
    /// flag. Canceled events are returned (not silently dropped) so the
    /// kernel can trace them.
    pub fn pop(&mut self) -> Option<(Event, bool)> {
        let Reverse(event) = self.heap.pop()?;
        let canceled = self.canceled.remove(&event.id);
        Some((event, canceled))
    }

    /// Marks one event canceled.
    pub fn cancel(&mut self, id: EventId) {
        self.canceled.insert(id);
    }

    /// Marks every pending event for `target` canceled and returns how many
    /// were newly marked. Linear in queue size, which stays small here.
    pub fn cancel_for(&mut self, target: EventTarget) -> usize {
        let mut marked = 0;
        for Reverse(event) in &self.heap {
            if event.target == target && self.canceled.insert(event.id) {
                marked += 1;
            }
        }
        marked
    }

    /// Tick of the next pending event, canceled or not.
    pub fn next_time(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(event)| event.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops all pending events.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.canceled.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn target() -> EventTarget {
        EventTarget::Node(NodeId::from_index(0))
    }

    fn push(queue: &mut EventQueue, time: u64, action: ActionKind, tiebreak: u64) -> EventId {
        queue.push(time, target(), action, String::new(), 0, tiebreak)
    }

    #[test]
    fn pops_in_time_order() {
        let mut queue = EventQueue::new();
        push(&mut queue, 30, ActionKind::Degrade, 0);
        push(&mut queue, 10, ActionKind::Degrade, 0);
        push(&mut queue, 20, ActionKind::Degrade, 0);

        let times: Vec<u64> = std::iter::from_fn(|| queue.pop().map(|(e, _)| e.time)).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn same_tick_orders_by_action_rank() {
        let mut queue = EventQueue::new();
        push(&mut queue, 5, ActionKind::GetPart, 0);
        push(&mut queue, 5, ActionKind::Fail, 0);
        push(&mut queue, 5, ActionKind::PutPart, 0);
        push(&mut queue, 5, ActionKind::Inspect, 0);

        let actions: Vec<ActionKind> =
            std::iter::from_fn(|| queue.pop().map(|(e, _)| e.action)).collect();
        assert_eq!(
            actions,
            vec![
                ActionKind::PutPart,
                ActionKind::Fail,
                ActionKind::Inspect,
                ActionKind::GetPart,
            ]
        );
    }

    #[test]
    fn equal_rank_orders_by_user_priority_then_tiebreak() {
        let mut queue = EventQueue::new();
        let high = queue.push(5, target(), ActionKind::Degrade, String::new(), 1, 0);
        let low_late = queue.push(5, target(), ActionKind::Degrade, String::new(), 0, 9);
        let low_early = queue.push(5, target(), ActionKind::Degrade, String::new(), 0, 2);

        let ids: Vec<EventId> = std::iter::from_fn(|| queue.pop().map(|(e, _)| e.id)).collect();
        assert_eq!(ids, vec![low_early, low_late, high]);
    }

    #[test]
    fn canceled_events_surface_with_flag() {
        let mut queue = EventQueue::new();
        let keep = push(&mut queue, 1, ActionKind::Degrade, 0);
        let drop = push(&mut queue, 1, ActionKind::Degrade, 1);
        queue.cancel(drop);

        let (first, first_canceled) = queue.pop().expect("first event");
        let (second, second_canceled) = queue.pop().expect("second event");
        assert_eq!(first.id, keep);
        assert!(!first_canceled);
        assert_eq!(second.id, drop);
        assert!(second_canceled);
    }

    #[test]
    fn cancel_for_marks_only_matching_target() {
        let mut queue = EventQueue::new();
        let mine = EventTarget::Node(NodeId::from_index(1));
        let theirs = EventTarget::Node(NodeId::from_index(2));
        queue.push(1, mine, ActionKind::RequestSpace, String::new(), 0, 0);
        queue.push(2, mine, ActionKind::GetPart, String::new(), 0, 0);
        queue.push(3, theirs, ActionKind::Degrade, String::new(), 0, 0);

        assert_eq!(queue.cancel_for(mine), 2);

        let live: Vec<EventTarget> = std::iter::from_fn(|| queue.pop())
            .filter(|(_, canceled)| !canceled)
            .map(|(e, _)| e.target)
            .collect();
        assert_eq!(live, vec![theirs]);
    }

    #[test_case(ActionKind::GenerateArrival, 0)]
    #[test_case(ActionKind::RequestSpace, 1)]
    #[test_case(ActionKind::PutPart, 2)]
    #[test_case(ActionKind::Restore, 3)]
    #[test_case(ActionKind::MaintainPlannedFailure, 4)]
    #[test_case(ActionKind::Degrade, 5)]
    #[test_case(ActionKind::EnterQueue, 6)]
    #[test_case(ActionKind::Fail, 7)]
    #[test_case(ActionKind::Inspect, 8)]
    #[test_case(ActionKind::Maintain, 9)]
    #[test_case(ActionKind::RequestPart, 10)]
    #[test_case(ActionKind::GetPart, 11)]
    #[test_case(ActionKind::Terminate, 12)]
    fn rank_table_is_fixed(action: ActionKind, rank: u8) {
        assert_eq!(action.rank(), rank);
    }

    proptest::proptest! {
        #[test]
        fn pop_order_is_non_decreasing_in_time(times in proptest::collection::vec(0u64..1000, 1..100)) {
            let mut queue = EventQueue::new();
            for (i, &t) in times.iter().enumerate() {
                push(&mut queue, t, ActionKind::Degrade, i as u64);
            }
            let mut last = 0;
            while let Some((event, _)) = queue.pop() {
                proptest::prop_assert!(event.time >= last);
                last = event.time;
            }
        }
    }
}
