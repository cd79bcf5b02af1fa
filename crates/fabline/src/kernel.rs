//! The simulation environment: clock, event queue, and run bookkeeping.
//!
//! A single [`Environment`] drives one replication. The clock is an integer
//! tick count that only ever moves forward; every action is scheduled at a
//! future tick by posting an event, and nothing in the simulator runs on
//! wall-clock time.

use std::path::Path;

use crate::error::SimError;
use crate::event::{ActionKind, Event, EventId, EventQueue, EventTarget};
use crate::rng::SimRng;
use crate::trace::EventTrace;

/// Discrete-event environment for one replication.
///
/// Invariant: at any clock value `t`, every event with `time < t` has been
/// executed or skipped as canceled.
#[derive(Debug, Clone)]
pub struct Environment {
    now: u64,
    warm_up_time: u64,
    queue: EventQueue,
    terminated: bool,
    rng: SimRng,
    trace: Option<EventTrace>,
    collect_data: bool,
    dequeued: u64,
}

impl Environment {
    /// Creates a fresh environment at tick zero.
    pub fn new(seed: u64, warm_up_time: u64, trace: bool, collect_data: bool) -> Self {
        Self {
            now: 0,
            warm_up_time,
            queue: EventQueue::new(),
            terminated: false,
            rng: SimRng::new(seed),
            trace: trace.then(EventTrace::new),
            collect_data,
            dequeued: 0,
        }
    }

    /// Current clock value.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// End of the statistics-free warm-up prefix.
    pub fn warm_up_time(&self) -> u64 {
        self.warm_up_time
    }

    /// True once statistics should accumulate.
    pub fn past_warm_up(&self) -> bool {
        self.now > self.warm_up_time
    }

    /// Whether per-tick time series should be recorded.
    pub fn collect_data(&self) -> bool {
        self.collect_data
    }

    /// The replication's RNG stream. Model sampling and tie-break draws
    /// share it, which is what makes traces reproducible per seed.
    pub fn rng_mut(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    /// Schedules an action with default user priority.
    pub fn schedule(
        &mut self,
        time: u64,
        target: EventTarget,
        action: ActionKind,
        source: String,
    ) -> EventId {
        self.schedule_prioritized(time, target, action, source, 0)
    }

    /// Schedules an action with an explicit user priority.
    pub fn schedule_prioritized(
        &mut self,
        time: u64,
        target: EventTarget,
        action: ActionKind,
        source: String,
        priority: i32,
    ) -> EventId {
        debug_assert!(time >= self.now, "scheduling into the past");
        let tiebreak = self.rng.next_f64().to_bits();
        self.queue.push(time, target, action, source, priority, tiebreak)
    }

    /// Marks every pending event for `target` canceled.
    pub fn cancel_events_for(&mut self, target: EventTarget) -> usize {
        self.queue.cancel_for(target)
    }

    /// Pops the next event, advancing the clock to its tick. The returned
    /// flag is true when the event was canceled in flight; the clock still
    /// advances for canceled events, matching their original schedule.
    pub fn pop_next(&mut self) -> Result<Option<(Event, bool)>, SimError> {
        let Some((event, canceled)) = self.queue.pop() else {
            return Ok(None);
        };
        if event.time < self.now {
            return Err(SimError::ClockRegression {
                now: self.now,
                event_time: event.time,
            });
        }
        self.now = event.time;
        self.dequeued += 1;
        Ok(Some((event, canceled)))
    }

    /// Records a trace row for the most recently popped event.
    pub fn record_trace(&mut self, event: &Event, location: &str, canceled: bool) {
        let index = self.dequeued.saturating_sub(1);
        if let Some(trace) = self.trace.as_mut() {
            trace.record(event, location, canceled, index);
        }
    }

    /// Clears the queue and stops the run loop.
    pub fn terminate(&mut self) {
        self.queue.clear();
        self.terminated = true;
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Number of events dequeued so far.
    pub fn events_dequeued(&self) -> u64 {
        self.dequeued
    }

    /// Number of events still pending (including canceled ones).
    pub fn events_pending(&self) -> usize {
        self.queue.len()
    }

    pub fn trace(&self) -> Option<&EventTrace> {
        self.trace.as_ref()
    }

    /// Hands the collected trace to the caller.
    pub fn take_trace(&mut self) -> Option<EventTrace> {
        self.trace.take()
    }

    /// Best-effort trace export used on the abort path.
    pub fn export_trace(&self, path: &Path) {
        if let Some(trace) = &self.trace
            && let Err(error) = trace.export_json(path)
        {
            tracing::error!(?path, %error, "failed to export event trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    fn env() -> Environment {
        Environment::new(11, 0, false, false)
    }

    #[test]
    fn clock_advances_to_event_time() {
        let mut env = env();
        env.schedule(
            8,
            EventTarget::Kernel,
            ActionKind::Terminate,
            String::new(),
        );
        let (event, canceled) = env.pop_next().expect("no regression").expect("event");
        assert_eq!(event.time, 8);
        assert!(!canceled);
        assert_eq!(env.now(), 8);
    }

    #[test]
    fn canceled_events_still_advance_the_clock() {
        let mut env = env();
        let target = EventTarget::Node(NodeId::from_index(0));
        env.schedule(3, target, ActionKind::Degrade, String::new());
        env.cancel_events_for(target);

        let (event, canceled) = env.pop_next().expect("no regression").expect("event");
        assert!(canceled);
        assert_eq!(event.time, 3);
        assert_eq!(env.now(), 3);
    }

    #[test]
    fn terminate_empties_the_queue() {
        let mut env = env();
        env.schedule(1, EventTarget::Kernel, ActionKind::Terminate, String::new());
        env.schedule(2, EventTarget::Kernel, ActionKind::Terminate, String::new());
        env.terminate();
        assert!(env.terminated());
        assert_eq!(env.events_pending(), 0);
        assert!(env.pop_next().expect("no regression").is_none());
    }

    #[test]
    fn warm_up_boundary_is_exclusive() {
        let mut env = Environment::new(0, 10, false, false);
        env.schedule(10, EventTarget::Kernel, ActionKind::Terminate, String::new());
        env.pop_next().expect("no regression");
        assert!(!env.past_warm_up());

        env.schedule(11, EventTarget::Kernel, ActionKind::Terminate, String::new());
        env.pop_next().expect("no regression");
        assert!(env.past_warm_up());
    }

    #[test]
    fn same_seed_draws_identical_tiebreaks() {
        let mut a = env();
        let mut b = env();
        for i in 0..20 {
            let ia = a.schedule(i, EventTarget::Kernel, ActionKind::Terminate, String::new());
            let ib = b.schedule(i, EventTarget::Kernel, ActionKind::Terminate, String::new());
            assert_eq!(ia, ib);
        }
        loop {
            match (a.pop_next().unwrap(), b.pop_next().unwrap()) {
                (Some((ea, _)), Some((eb, _))) => {
                    assert_eq!(ea.id, eb.id);
                    assert_eq!(ea.tiebreak, eb.tiebreak);
                }
                (None, None) => break,
                _ => panic!("queues diverged"),
            }
        }
    }
}
