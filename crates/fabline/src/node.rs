//! Topology nodes: sources, buffers, sinks, and the arena identifier.
//!
//! Parts move between nodes under a two-phase reservation protocol. A
//! receiver first reserves content on its chosen giver, a producer first
//! reserves vacancy on its chosen receiver, and the transfer itself happens
//! in a separate event. The reservation counters are what stop two machines
//! from double-booking the same unit or the same slot at one tick.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::machine::Machine;

// ============================================================================
// Node identity
// ============================================================================

/// Arena index of a node within one [`crate::System`].
///
/// Events and routing tables refer to nodes by this identifier only; there
/// are no back-pointers between nodes and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A node in the production graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Source(Source),
    Buffer(Buffer),
    Machine(Machine),
    Sink(Sink),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Source(source) => &source.name,
            Node::Buffer(buffer) => &buffer.name,
            Node::Machine(machine) => &machine.name,
            Node::Sink(sink) => &sink.name,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Source(_) => "source",
            Node::Buffer(_) => "buffer",
            Node::Machine(_) => "machine",
            Node::Sink(_) => "sink",
        }
    }
}

// ============================================================================
// Source
// ============================================================================

/// Stock held by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stock {
    /// Raw material is never exhausted.
    Unlimited,
    /// Finite stock replenished by arrivals.
    Count(u64),
}

/// Entry point of the line.
///
/// Without an interarrival time the source models unlimited supply. With
/// one, a unit materializes at the first tick where the arrival counter has
/// reached `interarrival` and the source is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub interarrival: Option<u64>,
    level: Stock,
    reserved_content: u64,
    arrival_counter: u64,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interarrival: None,
            level: Stock::Unlimited,
            reserved_content: 0,
            arrival_counter: 0,
        }
    }

    /// Limits the source to one arrival every `interarrival` ticks.
    pub fn with_interarrival(mut self, interarrival: u64) -> Self {
        self.interarrival = Some(interarrival);
        self.level = Stock::Count(0);
        self
    }

    pub(crate) fn reset(&mut self) {
        self.level = if self.interarrival.is_some() {
            Stock::Count(0)
        } else {
            Stock::Unlimited
        };
        self.reserved_content = 0;
        self.arrival_counter = 0;
    }

    pub fn level(&self) -> Stock {
        self.level
    }

    /// Whether a receiver may reserve a unit here.
    pub(crate) fn can_give(&self) -> bool {
        match self.level {
            Stock::Unlimited => true,
            Stock::Count(n) => n > self.reserved_content,
        }
    }

    pub(crate) fn reserve_content(&mut self) {
        self.reserved_content += 1;
    }

    pub(crate) fn release_content(&mut self) {
        self.reserved_content = self.reserved_content.saturating_sub(1);
    }

    /// Commits a previously reserved unit to the receiver.
    pub(crate) fn take(&mut self, now: u64) -> Result<(), SimError> {
        if self.reserved_content == 0 {
            return Err(SimError::InvariantViolation {
                time: now,
                location: self.name.clone(),
                message: "take without a content reservation".into(),
            });
        }
        self.reserved_content -= 1;
        if let Stock::Count(n) = self.level {
            if n == 0 {
                return Err(SimError::InvariantViolation {
                    time: now,
                    location: self.name.clone(),
                    message: "part taken from source before arrival".into(),
                });
            }
            self.level = Stock::Count(n - 1);
        }
        Ok(())
    }

    /// Advances the arrival counter one tick. Returns true when a new unit
    /// materialized.
    pub(crate) fn tick_arrival(&mut self) -> bool {
        let Some(interarrival) = self.interarrival else {
            return false;
        };
        self.arrival_counter += 1;
        if self.arrival_counter >= interarrival && self.level == Stock::Count(0) {
            self.level = Stock::Count(1);
            self.arrival_counter = 0;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// Finite intermediate storage between machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    pub capacity: u64,
    pub initial_level: u64,
    level: u64,
    reserved_content: u64,
    reserved_vacancy: u64,
    /// `(time, level)` samples, recorded only when data collection is on.
    level_series: Vec<(u64, u64)>,
}

impl Buffer {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            initial_level: 0,
            level: 0,
            reserved_content: 0,
            reserved_vacancy: 0,
            level_series: Vec::new(),
        }
    }

    /// Starts the buffer with stock already in it.
    pub fn with_initial_level(mut self, level: u64) -> Self {
        self.initial_level = level;
        self
    }

    pub(crate) fn reset(&mut self, collect_data: bool) {
        self.level = self.initial_level;
        self.reserved_content = 0;
        self.reserved_vacancy = 0;
        self.level_series.clear();
        if collect_data {
            self.level_series.push((0, self.initial_level));
        }
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn level_series(&self) -> &[(u64, u64)] {
        &self.level_series
    }

    pub(crate) fn reserved_content(&self) -> u64 {
        self.reserved_content
    }

    pub(crate) fn reserved_vacancy(&self) -> u64 {
        self.reserved_vacancy
    }

    /// Unreserved stock is available to a new receiver.
    pub(crate) fn can_give(&self) -> bool {
        self.level > self.reserved_content
    }

    /// Unreserved space is available to a new producer.
    pub(crate) fn can_receive(&self) -> bool {
        self.level + self.reserved_vacancy < self.capacity
    }

    pub(crate) fn reserve_content(&mut self) {
        self.reserved_content += 1;
    }

    pub(crate) fn release_content(&mut self) {
        self.reserved_content = self.reserved_content.saturating_sub(1);
    }

    pub(crate) fn reserve_vacancy(&mut self) {
        self.reserved_vacancy += 1;
    }

    pub(crate) fn release_vacancy(&mut self) {
        self.reserved_vacancy = self.reserved_vacancy.saturating_sub(1);
    }

    /// Commits a reserved unit out of the buffer.
    pub(crate) fn take(&mut self, now: u64, collect_data: bool) -> Result<(), SimError> {
        if self.level == 0 || self.reserved_content == 0 {
            return Err(SimError::InvariantViolation {
                time: now,
                location: self.name.clone(),
                message: format!(
                    "take from buffer with level {} and {} content reservations",
                    self.level, self.reserved_content
                ),
            });
        }
        self.level -= 1;
        self.reserved_content -= 1;
        if collect_data {
            self.level_series.push((now, self.level));
        }
        Ok(())
    }

    /// Commits a reserved unit into the buffer.
    pub(crate) fn put(&mut self, now: u64, collect_data: bool) -> Result<(), SimError> {
        if self.level >= self.capacity || self.reserved_vacancy == 0 {
            return Err(SimError::InvariantViolation {
                time: now,
                location: self.name.clone(),
                message: format!(
                    "put into buffer with level {}/{} and {} vacancy reservations",
                    self.level, self.capacity, self.reserved_vacancy
                ),
            });
        }
        self.level += 1;
        self.reserved_vacancy -= 1;
        if collect_data {
            self.level_series.push((now, self.level));
        }
        Ok(())
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Exit point of the line. Accepts unlimited parts and counts those
/// admitted after warm-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sink {
    pub name: String,
    pub initial_level: u64,
    level: u64,
}

impl Sink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_level: 0,
            level: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.level = self.initial_level;
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub(crate) fn put(&mut self, past_warm_up: bool) {
        if past_warm_up {
            self.level += 1;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_source_always_gives() {
        let mut source = Source::new("raw");
        source.reset();
        assert!(source.can_give());
        source.reserve_content();
        assert!(source.can_give());
        source.take(0).expect("unlimited stock");
    }

    #[test]
    fn timed_source_holds_until_counter_elapses() {
        let mut source = Source::new("raw").with_interarrival(3);
        source.reset();
        assert!(!source.can_give());
        assert!(!source.tick_arrival());
        assert!(!source.tick_arrival());
        assert!(source.tick_arrival());
        assert!(source.can_give());

        // Already holding a unit: the counter waits for it to drain.
        assert!(!source.tick_arrival());
        assert!(!source.tick_arrival());
        assert!(!source.tick_arrival());
        source.reserve_content();
        source.take(6).expect("stock present");
        assert!(source.tick_arrival());
    }

    #[test]
    fn take_from_empty_timed_source_is_an_invariant_violation() {
        let mut source = Source::new("raw").with_interarrival(5);
        source.reset();
        source.reserve_content();
        assert!(source.take(0).is_err());
    }

    #[test]
    fn buffer_reservations_gate_both_directions() {
        let mut buffer = Buffer::new("B1", 2);
        buffer.reset(false);

        assert!(!buffer.can_give());
        assert!(buffer.can_receive());

        buffer.reserve_vacancy();
        buffer.reserve_vacancy();
        assert!(!buffer.can_receive(), "capacity fully promised");

        buffer.put(1, false).expect("vacancy reserved");
        buffer.put(1, false).expect("vacancy reserved");
        assert_eq!(buffer.level(), 2);

        buffer.reserve_content();
        assert!(buffer.can_give(), "one unreserved unit remains");
        buffer.reserve_content();
        assert!(!buffer.can_give());

        buffer.take(2, false).expect("content reserved");
        buffer.take(2, false).expect("content reserved");
        assert_eq!(buffer.level(), 0);
    }

    #[test]
    fn buffer_put_without_reservation_fails() {
        let mut buffer = Buffer::new("B1", 1);
        buffer.reset(false);
        assert!(buffer.put(0, false).is_err());
    }

    #[test]
    fn buffer_records_level_series_when_collecting() {
        let mut buffer = Buffer::new("B1", 4).with_initial_level(1);
        buffer.reset(true);
        buffer.reserve_vacancy();
        buffer.put(3, true).expect("vacancy reserved");
        buffer.reserve_content();
        buffer.take(5, true).expect("content reserved");
        assert_eq!(buffer.level_series(), &[(0, 1), (3, 2), (5, 1)]);
    }

    #[test]
    fn sink_counts_only_after_warm_up() {
        let mut sink = Sink::new("done");
        sink.reset();
        sink.put(false);
        assert_eq!(sink.level(), 0);
        sink.put(true);
        sink.put(true);
        assert_eq!(sink.level(), 2);
    }
}
