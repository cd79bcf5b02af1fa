//! The machine: processing, degradation, failure, and repair state.
//!
//! A machine's behavior is driven entirely by scheduled events; the struct
//! here holds the state those events read and write, plus the sampling
//! helpers for cycle times, degradation holding times, and repair durations.
//! The event handlers themselves live on [`crate::System`], which owns the
//! node arena and the environment.

use serde::{Deserialize, Serialize};

use fabline_types::{DegradationMatrix, Distribution};

use crate::error::SimError;
use crate::node::NodeId;
use crate::rng::SimRng;

// ============================================================================
// Maintenance records
// ============================================================================

/// Why a repair ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// CBM threshold crossed before failure.
    Preventive,
    /// Machine reached the failed state.
    Corrective,
    /// Scheduled outage with an explicit duration.
    Planned,
}

/// One repair, as recorded in the machine's maintenance history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    /// Tick at which the repair began.
    pub time: u64,
    pub kind: RepairKind,
    /// Sampled repair duration.
    pub duration: u64,
}

/// A scheduled outage: the machine goes down at `time` for `duration` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFailure {
    pub time: u64,
    pub duration: u64,
}

// ============================================================================
// Machine
// ============================================================================

/// A processing stage with Markovian health degradation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    /// Exposed for selection-policy extensions; the core tie-break ignores it.
    pub selection_priority: i32,

    // Configuration
    pub cycle_time: Distribution,
    degradation: DegradationMatrix,
    cbm_threshold: usize,
    pm_time: Distribution,
    cm_time: Distribution,
    planned_failure: Option<PlannedFailure>,
    initial_health: usize,
    initial_remaining_process: Option<u64>,

    // Processing state
    pub(crate) remaining_process_time: u64,
    pub(crate) has_part: bool,
    pub(crate) has_finished_part: bool,

    // Flow state
    pub(crate) target_giver: Option<NodeId>,
    pub(crate) target_receiver: Option<NodeId>,
    pub(crate) reserved_content: u64,
    pub(crate) reserved_vacancy: u64,
    pub(crate) starved: bool,
    pub(crate) blocked: bool,

    // Health state
    pub(crate) health: usize,
    pub(crate) failed: bool,
    pub(crate) failed_at: Option<u64>,
    pub(crate) in_queue: bool,
    pub(crate) under_repair: bool,
    pub(crate) time_entered_queue: Option<u64>,
    pub(crate) active_repair: Option<RepairKind>,

    // Statistics
    pub(crate) parts_made: u64,
    pub(crate) downtime: u64,
    pub(crate) downtime_start: Option<u64>,
    production_series: Vec<(u64, u64)>,
    health_series: Vec<(u64, usize)>,
    maintenance_log: Vec<MaintenanceRecord>,
}

impl Machine {
    /// A machine that cycles at `cycle_time` and never degrades. Degradation
    /// and maintenance behavior are layered on with the `with_*` builders.
    pub fn new(name: impl Into<String>, cycle_time: Distribution) -> Self {
        Self {
            name: name.into(),
            selection_priority: 0,
            cycle_time,
            degradation: DegradationMatrix::identity(2),
            cbm_threshold: 1,
            pm_time: Distribution::Constant(1),
            cm_time: Distribution::Constant(1),
            planned_failure: None,
            initial_health: 0,
            initial_remaining_process: None,
            remaining_process_time: 0,
            has_part: false,
            has_finished_part: false,
            target_giver: None,
            target_receiver: None,
            reserved_content: 0,
            reserved_vacancy: 0,
            starved: false,
            blocked: false,
            health: 0,
            failed: false,
            failed_at: None,
            in_queue: false,
            under_repair: false,
            time_entered_queue: None,
            active_repair: None,
            parts_made: 0,
            downtime: 0,
            downtime_start: None,
            production_series: Vec::new(),
            health_series: Vec::new(),
            maintenance_log: Vec::new(),
        }
    }

    /// Sets the degradation chain and the CBM threshold. A `None` threshold
    /// means pure corrective maintenance: repair is requested only at the
    /// failed state. Thresholds are clamped into `[1, failed_state]`.
    pub fn with_degradation(
        mut self,
        degradation: DegradationMatrix,
        cbm_threshold: Option<usize>,
    ) -> Self {
        let failed_state = degradation.failed_state();
        self.cbm_threshold = cbm_threshold
            .unwrap_or(failed_state)
            .clamp(1, failed_state.max(1));
        self.degradation = degradation;
        self
    }

    /// Sets the preventive and corrective repair duration distributions.
    pub fn with_maintenance(mut self, pm_time: Distribution, cm_time: Distribution) -> Self {
        self.pm_time = pm_time;
        self.cm_time = cm_time;
        self
    }

    /// Schedules a fixed outage.
    pub fn with_planned_failure(mut self, time: u64, duration: u64) -> Self {
        self.planned_failure = Some(PlannedFailure { time, duration });
        self
    }

    /// Starts the machine at a degraded health state.
    pub fn with_initial_health(mut self, health: usize) -> Self {
        self.initial_health = health;
        self
    }

    /// Starts the machine mid-cycle, holding a part with `remaining` ticks
    /// of processing left.
    pub fn with_initial_remaining_process(mut self, remaining: u64) -> Self {
        self.initial_remaining_process = Some(remaining);
        self
    }

    /// Selection priority for custom dispatch policies.
    pub fn with_selection_priority(mut self, priority: i32) -> Self {
        self.selection_priority = priority;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn parts_made(&self) -> u64 {
        self.parts_made
    }

    pub fn health(&self) -> usize {
        self.health
    }

    pub fn downtime(&self) -> u64 {
        self.downtime
    }

    /// Fraction of the run the machine was not down for repair.
    pub fn availability(&self, total_time: u64) -> f64 {
        if total_time == 0 {
            return 1.0;
        }
        1.0 - self.downtime as f64 / total_time as f64
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_under_repair(&self) -> bool {
        self.under_repair
    }

    pub fn is_in_queue(&self) -> bool {
        self.in_queue
    }

    pub fn is_starved(&self) -> bool {
        self.starved
    }

    /// True while a part occupies the machine, in process or finished.
    pub fn holds_part(&self) -> bool {
        self.has_part || self.has_finished_part
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn degradation(&self) -> &DegradationMatrix {
        &self.degradation
    }

    pub fn cbm_threshold(&self) -> usize {
        self.cbm_threshold
    }

    pub fn failed_state(&self) -> usize {
        self.degradation.failed_state()
    }

    pub fn planned_failure(&self) -> Option<PlannedFailure> {
        self.planned_failure
    }

    pub(crate) fn initial_health(&self) -> usize {
        self.initial_health
    }

    pub(crate) fn initial_remaining_process(&self) -> Option<u64> {
        self.initial_remaining_process
    }

    pub fn production_series(&self) -> &[(u64, u64)] {
        &self.production_series
    }

    pub fn health_series(&self) -> &[(u64, usize)] {
        &self.health_series
    }

    pub fn maintenance_log(&self) -> &[MaintenanceRecord] {
        &self.maintenance_log
    }

    // ------------------------------------------------------------------
    // Reservation ports
    // ------------------------------------------------------------------

    /// A machine can accept a part only when it is genuinely idle: no part
    /// in process, no finished part waiting, no pull or push already
    /// committed, and not down.
    pub(crate) fn can_receive(&self) -> bool {
        !self.has_part
            && !self.has_finished_part
            && !self.failed
            && !self.under_repair
            && self.target_giver.is_none()
            && self.reserved_vacancy == 0
    }

    /// A machine can hand over a finished part while healthy, and also at
    /// the exact instant of failure, so the last completed unit of a
    /// failing machine is not lost.
    pub(crate) fn can_give(&self, now: u64) -> bool {
        if !self.has_finished_part || self.reserved_content > 0 {
            return false;
        }
        if self.under_repair {
            return false;
        }
        !self.failed || self.failed_at == Some(now)
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

    /// Commits this machine's finished part to a downstream puller.
    pub(crate) fn surrender_finished_part(
        &mut self,
        now: u64,
        past_warm_up: bool,
        collect_data: bool,
    ) -> Result<(), SimError> {
        if !self.has_finished_part || self.reserved_content == 0 {
            return Err(SimError::InvariantViolation {
                time: now,
                location: self.name.clone(),
                message: "finished part taken without a reservation".into(),
            });
        }
        self.reserved_content -= 1;
        self.has_finished_part = false;
        self.has_part = false;
        self.blocked = false;
        self.count_part(now, past_warm_up, collect_data);
        Ok(())
    }

    /// Accepts a part pushed directly by an upstream machine.
    pub(crate) fn accept_part(&mut self, now: u64) -> Result<(), SimError> {
        if self.reserved_vacancy == 0 || self.has_part || self.has_finished_part {
            return Err(SimError::InvariantViolation {
                time: now,
                location: self.name.clone(),
                message: "part pushed without a vacancy reservation".into(),
            });
        }
        self.reserved_vacancy -= 1;
        self.has_part = true;
        self.starved = false;
        Ok(())
    }

    /// Bumps the production counter once a part departs.
    pub(crate) fn count_part(&mut self, now: u64, past_warm_up: bool, collect_data: bool) {
        if past_warm_up {
            self.parts_made += 1;
            if collect_data {
                self.production_series.push((now, self.parts_made));
            }
        }
    }

    pub(crate) fn record_health(&mut self, now: u64, collect_data: bool) {
        if collect_data {
            self.health_series.push((now, self.health));
        }
    }

    pub(crate) fn record_maintenance(&mut self, record: MaintenanceRecord) {
        self.maintenance_log.push(record);
    }

    // ------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------

    pub(crate) fn sample_cycle(&self, rng: &mut SimRng) -> u64 {
        self.cycle_time.sample(rng)
    }

    /// Ticks until the next `degrade` event, or `None` when the current
    /// health row is absorbing and the machine cannot degrade further.
    pub(crate) fn sample_time_to_degrade(&self, rng: &mut SimRng) -> Option<u64> {
        self.degradation.sample_holding_time(self.health, rng)
    }

    /// Repair kind and duration for a repair starting now. Corrective when
    /// failed at this moment, preventive otherwise.
    pub(crate) fn sample_repair(&self, rng: &mut SimRng) -> (RepairKind, u64) {
        if self.failed {
            (RepairKind::Corrective, self.cm_time.sample(rng))
        } else {
            (RepairKind::Preventive, self.pm_time.sample(rng))
        }
    }

    /// Expected duration of the repair this machine currently needs.
    pub(crate) fn expected_repair_time(&self) -> f64 {
        if self.failed {
            self.cm_time.mean()
        } else {
            self.pm_time.mean()
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restores initial conditions ahead of a replication.
    pub(crate) fn reset(&mut self, collect_data: bool) {
        self.health = self.initial_health.min(self.failed_state());
        self.remaining_process_time = self.initial_remaining_process.unwrap_or(0);
        self.has_part = self.initial_remaining_process.is_some();
        self.has_finished_part = false;
        self.target_giver = None;
        self.target_receiver = None;
        self.reserved_content = 0;
        self.reserved_vacancy = 0;
        self.starved = false;
        self.blocked = false;
        self.failed = false;
        self.failed_at = None;
        self.in_queue = false;
        self.under_repair = false;
        self.time_entered_queue = None;
        self.active_repair = None;
        self.parts_made = 0;
        self.downtime = 0;
        self.downtime_start = None;
        self.production_series.clear();
        self.health_series.clear();
        self.maintenance_log.clear();
        if collect_data {
            self.health_series.push((0, self.health));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        let mut machine = Machine::new("M1", Distribution::Constant(2));
        machine.reset(false);
        machine
    }

    #[test]
    fn idle_machine_receives_but_does_not_give() {
        let machine = machine();
        assert!(machine.can_receive());
        assert!(!machine.can_give(0));
    }

    #[test]
    fn finished_part_makes_machine_a_giver() {
        let mut machine = machine();
        machine.has_part = true;
        machine.has_finished_part = true;
        assert!(machine.can_give(5));
        assert!(!machine.can_receive());

        machine.reserve_content();
        assert!(!machine.can_give(5), "reserved part is committed");
    }

    #[test]
    fn failed_machine_gives_only_at_the_failure_instant() {
        let mut machine = machine();
        machine.has_part = true;
        machine.has_finished_part = true;
        machine.failed = true;
        machine.failed_at = Some(9);
        assert!(machine.can_give(9));
        assert!(!machine.can_give(10));
    }

    #[test]
    fn surrender_counts_production_after_warm_up() {
        let mut machine = machine();
        machine.has_part = true;
        machine.has_finished_part = true;
        machine.reserve_content();
        machine
            .surrender_finished_part(3, false, false)
            .expect("reserved");
        assert_eq!(machine.parts_made(), 0, "warm-up part is not counted");

        machine.has_part = true;
        machine.has_finished_part = true;
        machine.reserve_content();
        machine
            .surrender_finished_part(8, true, false)
            .expect("reserved");
        assert_eq!(machine.parts_made(), 1);
    }

    #[test]
    fn repair_kind_follows_failed_flag() {
        let mut rng = SimRng::new(0);
        let mut machine = Machine::new("M1", Distribution::Constant(1))
            .with_degradation(
                DegradationMatrix::upper_bidiagonal(4, 0.5).expect("valid"),
                Some(2),
            )
            .with_maintenance(Distribution::Constant(3), Distribution::Constant(11));
        machine.reset(false);

        let (kind, duration) = machine.sample_repair(&mut rng);
        assert_eq!(kind, RepairKind::Preventive);
        assert_eq!(duration, 3);

        machine.failed = true;
        let (kind, duration) = machine.sample_repair(&mut rng);
        assert_eq!(kind, RepairKind::Corrective);
        assert_eq!(duration, 11);
    }

    #[test]
    fn cbm_threshold_defaults_to_pure_corrective() {
        let machine = Machine::new("M1", Distribution::Constant(1)).with_degradation(
            DegradationMatrix::upper_bidiagonal(6, 0.2).expect("valid"),
            None,
        );
        assert_eq!(machine.cbm_threshold(), machine.failed_state());
    }

    #[test]
    fn identity_degradation_never_schedules_a_degrade() {
        let mut rng = SimRng::new(1);
        let machine = machine();
        assert!(machine.sample_time_to_degrade(&mut rng).is_none());
    }

    #[test]
    fn availability_is_one_minus_downtime_share() {
        let mut machine = machine();
        machine.downtime = 250;
        assert!((machine.availability(1000) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn reset_restores_initial_conditions() {
        let mut machine = Machine::new("M1", Distribution::Constant(1))
            .with_initial_health(2)
            .with_degradation(
                DegradationMatrix::upper_bidiagonal(5, 0.1).expect("valid"),
                Some(3),
            )
            .with_initial_remaining_process(4);
        machine.reset(false);
        machine.parts_made = 7;
        machine.failed = true;
        machine.health = 4;

        machine.reset(false);
        assert_eq!(machine.health(), 2);
        assert_eq!(machine.parts_made(), 0);
        assert!(!machine.is_failed());
        assert!(machine.has_part, "starts mid-cycle with a part");
        assert_eq!(machine.remaining_process_time, 4);
    }
}
