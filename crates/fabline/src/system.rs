//! The system façade: topology wiring, event dispatch, and the run loop.
//!
//! A [`System`] owns the node arena, the routing tables, the maintainer,
//! and one [`Environment`] per replication. Every event handler is a method
//! here: handlers read and mutate node state synchronously and post further
//! events, so the whole replication is single-threaded and deterministic
//! given its seed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::SimError;
use crate::event::{ActionKind, Event, EventTarget};
use crate::kernel::Environment;
use crate::machine::{Machine, MaintenanceRecord, RepairKind};
use crate::maintainer::{MaintenanceRequest, Maintainer};
use crate::node::{Buffer, Node, NodeId, Sink, Source};

// ============================================================================
// Builder
// ============================================================================

/// Assembles a production line: add nodes, connect them, and build.
#[derive(Debug, Clone, Default)]
pub struct SystemBuilder {
    nodes: Vec<Node>,
    upstream: Vec<Vec<NodeId>>,
    downstream: Vec<Vec<NodeId>>,
    maintainer: Option<Maintainer>,
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(node);
        self.upstream.push(Vec::new());
        self.downstream.push(Vec::new());
        id
    }

    pub fn add_source(&mut self, source: Source) -> NodeId {
        self.push(Node::Source(source))
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> NodeId {
        self.push(Node::Buffer(buffer))
    }

    pub fn add_machine(&mut self, machine: Machine) -> NodeId {
        self.push(Node::Machine(machine))
    }

    pub fn add_sink(&mut self, sink: Sink) -> NodeId {
        self.push(Node::Sink(sink))
    }

    /// Declares that parts flow from `from` into `to`.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> &mut Self {
        if !self.downstream[from.index()].contains(&to) {
            self.downstream[from.index()].push(to);
        }
        if !self.upstream[to.index()].contains(&from) {
            self.upstream[to.index()].push(from);
        }
        self
    }

    /// Replaces the default unbounded FIFO maintainer.
    pub fn maintainer(&mut self, maintainer: Maintainer) -> &mut Self {
        self.maintainer = Some(maintainer);
        self
    }

    /// Validates the graph and produces a runnable system.
    ///
    /// Fatal problems (dangling machines, impossible flows, over-full
    /// buffers, duplicate names) return [`SimError::Build`]; suspicious but
    /// legal layouts are logged as warnings.
    pub fn build(self) -> Result<System, SimError> {
        let mut names = std::collections::HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name().to_owned()) {
                return Err(SimError::Build(format!(
                    "duplicate node name `{}`",
                    node.name()
                )));
            }
        }

        let mut machines = Vec::new();
        let mut sources = Vec::new();
        let mut sinks = Vec::new();

        for (index, node) in self.nodes.iter().enumerate() {
            let id = NodeId::from_index(index);
            let ups = &self.upstream[index];
            let downs = &self.downstream[index];
            match node {
                Node::Source(_) => {
                    if !ups.is_empty() {
                        return Err(SimError::Build(format!(
                            "source `{}` cannot have upstream neighbors",
                            node.name()
                        )));
                    }
                    sources.push(id);
                }
                Node::Sink(_) => {
                    if !downs.is_empty() {
                        return Err(SimError::Build(format!(
                            "sink `{}` cannot have downstream neighbors",
                            node.name()
                        )));
                    }
                    sinks.push(id);
                }
                Node::Buffer(buffer) => {
                    if buffer.capacity == 0 {
                        return Err(SimError::Build(format!(
                            "buffer `{}` needs a capacity of at least 1",
                            buffer.name
                        )));
                    }
                    if buffer.initial_level > buffer.capacity {
                        return Err(SimError::Build(format!(
                            "buffer `{}` starts above capacity ({} > {})",
                            buffer.name, buffer.initial_level, buffer.capacity
                        )));
                    }
                }
                Node::Machine(machine) => {
                    if ups.is_empty() || downs.is_empty() {
                        return Err(SimError::Build(format!(
                            "machine `{}` must have an upstream and a downstream neighbor",
                            machine.name
                        )));
                    }
                    if ups.len() > 1 || downs.len() > 1 {
                        warn!(
                            machine = %machine.name,
                            upstream = ups.len(),
                            downstream = downs.len(),
                            "machine connected to more than one neighbor per side; \
                             rearrange so each machine gives and takes from one buffer"
                        );
                    }
                    let start_health = machine.initial_health().min(machine.failed_state());
                    if machine.planned_failure().is_some()
                        && !machine.degradation().is_absorbing(start_health)
                    {
                        warn!(
                            machine = %machine.name,
                            "planned failure combined with random degradation"
                        );
                    }
                    if ups.iter().any(|u| matches!(self.nodes[u.index()], Node::Sink(_))) {
                        return Err(SimError::Build(format!(
                            "machine `{}` cannot pull from a sink",
                            machine.name
                        )));
                    }
                    if downs.iter().any(|d| matches!(self.nodes[d.index()], Node::Source(_))) {
                        return Err(SimError::Build(format!(
                            "machine `{}` cannot push into a source",
                            machine.name
                        )));
                    }
                    machines.push(id);
                }
            }
        }

        Ok(System {
            env: Environment::new(0, 0, false, false),
            nodes: self.nodes,
            upstream: self.upstream,
            downstream: self.downstream,
            machines,
            sources,
            sinks,
            maintainer: self.maintainer.unwrap_or_else(|| Maintainer::new(None)),
        })
    }
}

// ============================================================================
// Run configuration and results
// ============================================================================

/// Parameters for one replication.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Statistics-free prefix; events fire normally during it.
    pub warm_up_time: u64,
    /// Measured portion of the run.
    pub simulation_time: u64,
    pub seed: u64,
    pub verbose: bool,
    /// Collect the event trace.
    pub trace: bool,
    /// Collect per-tick time series on buffers and machines.
    pub collect_data: bool,
    /// Where to export the trace on termination (and on abort).
    pub trace_path: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(simulation_time: u64) -> Self {
        Self {
            simulation_time,
            ..Self::default()
        }
    }

    pub fn with_warm_up(mut self, warm_up_time: u64) -> Self {
        self.warm_up_time = warm_up_time;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    pub fn with_collect_data(mut self) -> Self {
        self.collect_data = true;
        self
    }

    pub fn with_trace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace = true;
        self.trace_path = Some(path.into());
        self
    }

    fn horizon(&self) -> u64 {
        self.warm_up_time + self.simulation_time
    }
}

/// Metrics from one completed replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub seed: u64,
    pub final_time: u64,
    pub events_executed: u64,
    /// Sum of sink levels.
    pub production: u64,
    /// Per machine, in insertion order.
    pub machine_production: Vec<u64>,
    /// `1 - downtime / total_time` per machine, in insertion order.
    pub machine_availability: Vec<f64>,
}

/// Deep copy of the end-of-run state, for offline analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub time: u64,
    pub seed: u64,
    pub nodes: Vec<Node>,
    pub maintainer_utilization: u64,
}

// ============================================================================
// Typed arena access
// ============================================================================

fn machine_in(nodes: &[Node], id: NodeId, now: u64) -> Result<&Machine, SimError> {
    match &nodes[id.index()] {
        Node::Machine(machine) => Ok(machine),
        other => Err(SimError::InvariantViolation {
            time: now,
            location: other.name().to_owned(),
            message: "machine event targeted a non-machine node".into(),
        }),
    }
}

fn machine_mut_in(nodes: &mut [Node], id: NodeId, now: u64) -> Result<&mut Machine, SimError> {
    match &mut nodes[id.index()] {
        Node::Machine(machine) => Ok(machine),
        other => Err(SimError::InvariantViolation {
            time: now,
            location: other.name().to_owned(),
            message: "machine event targeted a non-machine node".into(),
        }),
    }
}

// ============================================================================
// System
// ============================================================================

/// A wired production line, ready to simulate.
#[derive(Debug, Clone)]
pub struct System {
    env: Environment,
    nodes: Vec<Node>,
    upstream: Vec<Vec<NodeId>>,
    downstream: Vec<Vec<NodeId>>,
    machines: Vec<NodeId>,
    sources: Vec<NodeId>,
    sinks: Vec<NodeId>,
    maintainer: Maintainer,
}

impl System {
    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Runs one replication in place.
    ///
    /// On an invariant violation the trace (if enabled) is exported first
    /// and the error is returned; state is left as it was at the failing
    /// event for post-mortem inspection.
    pub fn simulate(&mut self, options: &RunOptions) -> Result<RunSummary, SimError> {
        self.initialize(options);
        self.env.schedule(
            options.horizon(),
            EventTarget::Kernel,
            ActionKind::Terminate,
            "simulate".into(),
        );

        if let Err(error) = self.run_loop() {
            if let Some(path) = &options.trace_path {
                self.env.export_trace(path);
            }
            tracing::error!(seed = options.seed, %error, "simulation aborted");
            return Err(error);
        }

        self.close_downtime();
        if let Some(path) = &options.trace_path {
            self.env.export_trace(path);
        }

        let summary = self.summarize(options);
        if options.verbose {
            info!(
                seed = summary.seed,
                production = summary.production,
                events = summary.events_executed,
                "simulation finished"
            );
        }
        Ok(summary)
    }

    pub fn machine_ids(&self) -> &[NodeId] {
        &self.machines
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn machine(&self, id: NodeId) -> Option<&Machine> {
        match &self.nodes[id.index()] {
            Node::Machine(machine) => Some(machine),
            _ => None,
        }
    }

    pub fn maintainer(&self) -> &Maintainer {
        &self.maintainer
    }

    /// Total parts admitted by all sinks.
    pub fn production(&self) -> u64 {
        self.sinks
            .iter()
            .map(|&id| match &self.nodes[id.index()] {
                Node::Sink(sink) => sink.level(),
                _ => 0,
            })
            .sum()
    }

    pub fn now(&self) -> u64 {
        self.env.now()
    }

    /// The collected event trace of the last run, if tracing was enabled.
    pub fn trace(&self) -> Option<&crate::trace::EventTrace> {
        self.env.trace()
    }

    pub fn take_trace(&mut self) -> Option<crate::trace::EventTrace> {
        self.env.take_trace()
    }

    /// Deep end-of-run snapshot for offline analysis.
    pub fn snapshot(&self, seed: u64) -> SystemSnapshot {
        SystemSnapshot {
            time: self.env.now(),
            seed,
            nodes: self.nodes.clone(),
            maintainer_utilization: self.maintainer.utilization(),
        }
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    fn initialize(&mut self, options: &RunOptions) {
        self.env = Environment::new(
            options.seed,
            options.warm_up_time,
            options.trace,
            options.collect_data,
        );
        self.maintainer.reset();
        let collect = options.collect_data;
        for node in &mut self.nodes {
            match node {
                Node::Source(source) => source.reset(),
                Node::Buffer(buffer) => buffer.reset(collect),
                Node::Machine(machine) => machine.reset(collect),
                Node::Sink(sink) => sink.reset(),
            }
        }

        // Machines schedule their internal events first so that health
        // transitions queued for tick 0 outrank the initial part requests.
        for &id in &self.machines.clone() {
            self.initialize_machine(id);
        }
        for &id in &self.sources.clone() {
            self.initialize_source(id);
        }
    }

    fn initialize_machine(&mut self, id: NodeId) {
        let (name, planned, initially_failed, above_threshold, initial_part) = {
            let machine = self.machine(id).expect("machine id");
            (
                machine.name.clone(),
                machine.planned_failure(),
                machine.health() >= machine.failed_state(),
                machine.health() >= machine.cbm_threshold(),
                machine.initial_remaining_process(),
            )
        };
        let tag = format!("{name}.initialize at 0");

        if let Some(planned) = planned {
            self.env.schedule(
                planned.time,
                EventTarget::Node(id),
                ActionKind::MaintainPlannedFailure,
                tag.clone(),
            );
        }

        if initially_failed {
            // A machine born broken files a corrective request before any
            // production event runs.
            self.env
                .schedule(0, EventTarget::Node(id), ActionKind::Fail, tag.clone());
        } else if above_threshold {
            self.env
                .schedule(0, EventTarget::Node(id), ActionKind::EnterQueue, tag.clone());
        }

        let time_to_degrade =
            machine_in(&self.nodes, id, 0).expect("machine id").sample_time_to_degrade(self.env.rng_mut());
        if let Some(ttd) = time_to_degrade {
            self.env
                .schedule(ttd, EventTarget::Node(id), ActionKind::Degrade, tag.clone());
        }

        match initial_part {
            Some(remaining) => {
                self.env.schedule(
                    remaining,
                    EventTarget::Node(id),
                    ActionKind::RequestSpace,
                    tag,
                );
            }
            None => {
                self.env
                    .schedule(0, EventTarget::Node(id), ActionKind::RequestPart, tag);
            }
        }
    }

    fn initialize_source(&mut self, id: NodeId) {
        let (name, timed) = {
            let Node::Source(source) = &self.nodes[id.index()] else {
                return;
            };
            (source.name.clone(), source.interarrival.is_some())
        };
        let tag = format!("{name}.initialize at 0");

        if timed {
            self.env.schedule(
                1,
                EventTarget::Node(id),
                ActionKind::GenerateArrival,
                tag.clone(),
            );
        }

        // Nudge downstream machines; request_part is guarded, so waking a
        // machine that already has work scheduled is harmless.
        for &receiver in &self.downstream[id.index()].clone() {
            if matches!(self.nodes[receiver.index()], Node::Machine(_)) {
                self.env.schedule(
                    0,
                    EventTarget::Node(receiver),
                    ActionKind::RequestPart,
                    tag.clone(),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    fn run_loop(&mut self) -> Result<(), SimError> {
        while !self.env.terminated() {
            let Some((event, canceled)) = self.env.pop_next()? else {
                break;
            };
            let location = self.location_name(event.target);
            self.env.record_trace(&event, &location, canceled);
            if canceled {
                continue;
            }
            trace!(
                target: "fabline::kernel",
                time = event.time,
                action = event.action.name(),
                location = %location,
                "execute"
            );
            self.execute(&event)?;
            self.check_invariants()?;
        }
        Ok(())
    }

    fn location_name(&self, target: EventTarget) -> String {
        match target {
            EventTarget::Node(id) => self.nodes[id.index()].name().to_owned(),
            EventTarget::Maintainer => "maintainer".to_owned(),
            EventTarget::Kernel => "environment".to_owned(),
        }
    }

    fn execute(&mut self, event: &Event) -> Result<(), SimError> {
        match (event.target, event.action) {
            (EventTarget::Kernel, ActionKind::Terminate) => {
                self.env.terminate();
                Ok(())
            }
            (EventTarget::Maintainer, ActionKind::Inspect) => self.inspect(),
            (EventTarget::Node(id), action) => match action {
                ActionKind::GenerateArrival => self.generate_arrival(id),
                ActionKind::RequestPart => self.request_part(id),
                ActionKind::GetPart => self.get_part(id),
                ActionKind::RequestSpace => self.request_space(id),
                ActionKind::PutPart => self.put_part(id),
                ActionKind::Degrade => self.degrade(id),
                ActionKind::EnterQueue => self.enter_queue(id),
                ActionKind::Fail => self.fail(id),
                ActionKind::Maintain => self.maintain(id),
                ActionKind::MaintainPlannedFailure => self.maintain_planned_failure(id),
                ActionKind::Restore => self.restore(id),
                ActionKind::Inspect | ActionKind::Terminate => Err(SimError::UnexpectedEvent {
                    time: event.time,
                    location: self.location_name(event.target),
                    action,
                    message: "kernel action targeted a node".into(),
                }),
            },
            (target, action) => Err(SimError::UnexpectedEvent {
                time: event.time,
                location: self.location_name(target),
                action,
                message: "no handler for this target".into(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Handoff predicates
    // ------------------------------------------------------------------

    fn node_can_give(&self, id: NodeId, now: u64) -> bool {
        match &self.nodes[id.index()] {
            Node::Source(source) => source.can_give(),
            Node::Buffer(buffer) => buffer.can_give(),
            Node::Machine(machine) => machine.can_give(now),
            Node::Sink(_) => false,
        }
    }

    fn node_can_receive(&self, id: NodeId) -> bool {
        match &self.nodes[id.index()] {
            Node::Source(_) => false,
            Node::Buffer(buffer) => buffer.can_receive(),
            Node::Machine(machine) => machine.can_receive(),
            Node::Sink(_) => true,
        }
    }

    fn reserve_content_at(&mut self, id: NodeId) {
        match &mut self.nodes[id.index()] {
            Node::Source(source) => source.reserve_content(),
            Node::Buffer(buffer) => buffer.reserve_content(),
            Node::Machine(machine) => machine.reserve_content(),
            Node::Sink(_) => {}
        }
    }

    fn reserve_vacancy_at(&mut self, id: NodeId) {
        match &mut self.nodes[id.index()] {
            Node::Buffer(buffer) => buffer.reserve_vacancy(),
            Node::Machine(machine) => machine.reserve_vacancy(),
            Node::Source(_) | Node::Sink(_) => {}
        }
    }

    /// Releases any reservations this machine holds on its neighbors, e.g.
    /// when a pending transfer is canceled by failure or repair.
    fn release_flow_targets(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let (giver, receiver) = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            (machine.target_giver.take(), machine.target_receiver.take())
        };
        if let Some(giver) = giver {
            match &mut self.nodes[giver.index()] {
                Node::Source(source) => source.release_content(),
                Node::Buffer(buffer) => buffer.release_content(),
                Node::Machine(machine) => machine.release_content(),
                Node::Sink(_) => {}
            }
        }
        if let Some(receiver) = receiver {
            match &mut self.nodes[receiver.index()] {
                Node::Buffer(buffer) => buffer.release_vacancy(),
                Node::Machine(machine) => machine.release_vacancy(),
                Node::Source(_) | Node::Sink(_) => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Source handlers
    // ------------------------------------------------------------------

    fn generate_arrival(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let (arrived, name) = match &mut self.nodes[id.index()] {
            Node::Source(source) => (source.tick_arrival(), source.name.clone()),
            other => {
                return Err(SimError::UnexpectedEvent {
                    time: now,
                    location: other.name().to_owned(),
                    action: ActionKind::GenerateArrival,
                    message: "arrival on a non-source node".into(),
                });
            }
        };

        self.env.schedule(
            now + 1,
            EventTarget::Node(id),
            ActionKind::GenerateArrival,
            format!("{name}.generate_arrival at {now}"),
        );

        if arrived {
            self.wake_receivers_of(id, &name);
        }
        Ok(())
    }

    /// Offers fresh content to downstream machines that are free to pull.
    fn wake_receivers_of(&mut self, giver: NodeId, tag_owner: &str) {
        let now = self.env.now();
        for &receiver in &self.downstream[giver.index()].clone() {
            if matches!(self.nodes[receiver.index()], Node::Machine(_))
                && self.node_can_receive(receiver)
            {
                self.env.schedule(
                    now,
                    EventTarget::Node(receiver),
                    ActionKind::RequestPart,
                    format!("{tag_owner}.wake at {now}"),
                );
            }
        }
    }

    /// Re-offers freed space to upstream machines blocked on this node.
    fn wake_blocked_upstream_of(&mut self, receiver: NodeId, tag_owner: &str) {
        let now = self.env.now();
        for &giver in &self.upstream[receiver.index()].clone() {
            if let Node::Machine(machine) = &self.nodes[giver.index()]
                && machine.is_blocked()
            {
                self.env.schedule(
                    now,
                    EventTarget::Node(giver),
                    ActionKind::RequestSpace,
                    format!("{tag_owner}.wake at {now}"),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Machine flow handlers
    // ------------------------------------------------------------------

    fn request_part(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        {
            let machine = machine_in(&self.nodes, id, now)?;
            if machine.has_part
                || machine.has_finished_part
                || machine.failed
                || machine.under_repair
                || machine.target_giver.is_some()
            {
                return Ok(());
            }
        }

        let candidates: Vec<NodeId> = self.upstream[id.index()]
            .iter()
            .copied()
            .filter(|&giver| self.node_can_give(giver, now))
            .collect();

        if candidates.is_empty() {
            machine_mut_in(&mut self.nodes, id, now)?.starved = true;
            return Ok(());
        }

        let giver = candidates[self.env.rng_mut().index(candidates.len())];
        self.reserve_content_at(giver);
        let name = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            machine.starved = false;
            machine.target_giver = Some(giver);
            machine.name.clone()
        };
        self.env.schedule(
            now,
            EventTarget::Node(id),
            ActionKind::GetPart,
            format!("{name}.request_part at {now}"),
        );
        Ok(())
    }

    fn get_part(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let past_warm_up = self.env.past_warm_up();
        let collect = self.env.collect_data();

        let giver = machine_mut_in(&mut self.nodes, id, now)?.target_giver.take();
        let Some(giver) = giver else {
            return Err(SimError::UnexpectedEvent {
                time: now,
                location: self.nodes[id.index()].name().to_owned(),
                action: ActionKind::GetPart,
                message: "get_part without a reserved giver".into(),
            });
        };

        let giver_name = self.nodes[giver.index()].name().to_owned();
        match &mut self.nodes[giver.index()] {
            Node::Source(source) => source.take(now)?,
            Node::Buffer(buffer) => buffer.take(now, collect)?,
            Node::Machine(machine) => {
                machine.surrender_finished_part(now, past_warm_up, collect)?;
            }
            Node::Sink(_) => {
                return Err(SimError::UnexpectedEvent {
                    time: now,
                    location: giver_name,
                    action: ActionKind::GetPart,
                    message: "cannot pull a part from a sink".into(),
                });
            }
        }

        let cycle = {
            let distribution = machine_in(&self.nodes, id, now)?.cycle_time;
            distribution.sample(self.env.rng_mut())
        };
        let name = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            machine.has_part = true;
            machine.starved = false;
            machine.remaining_process_time = cycle;
            machine.name.clone()
        };
        self.env.schedule(
            now + cycle,
            EventTarget::Node(id),
            ActionKind::RequestSpace,
            format!("{name}.get_part at {now}"),
        );

        // The giver just shed a unit: blocked machines above a buffer can
        // retry, and a machine giver turns around and pulls its next part.
        let giver_is_buffer = matches!(self.nodes[giver.index()], Node::Buffer(_));
        let giver_is_machine = matches!(self.nodes[giver.index()], Node::Machine(_));
        if giver_is_buffer {
            self.wake_blocked_upstream_of(giver, &giver_name);
        } else if giver_is_machine {
            self.env.schedule(
                now,
                EventTarget::Node(giver),
                ActionKind::RequestPart,
                format!("{giver_name}.get_part at {now}"),
            );
        }
        Ok(())
    }

    fn request_space(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        {
            let machine = machine_in(&self.nodes, id, now)?;
            if !machine.has_part
                || machine.failed
                || machine.under_repair
                || machine.target_receiver.is_some()
            {
                return Ok(());
            }
        }
        {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            machine.has_finished_part = true;
            machine.remaining_process_time = 0;
        }

        let candidates: Vec<NodeId> = self.downstream[id.index()]
            .iter()
            .copied()
            .filter(|&receiver| self.node_can_receive(receiver))
            .collect();

        if candidates.is_empty() {
            machine_mut_in(&mut self.nodes, id, now)?.blocked = true;
            return Ok(());
        }

        let receiver = candidates[self.env.rng_mut().index(candidates.len())];
        self.reserve_vacancy_at(receiver);
        let name = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            machine.blocked = false;
            machine.target_receiver = Some(receiver);
            machine.name.clone()
        };
        self.env.schedule(
            now,
            EventTarget::Node(id),
            ActionKind::PutPart,
            format!("{name}.request_space at {now}"),
        );
        Ok(())
    }

    fn put_part(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let past_warm_up = self.env.past_warm_up();
        let collect = self.env.collect_data();

        let receiver = machine_mut_in(&mut self.nodes, id, now)?.target_receiver.take();
        let Some(receiver) = receiver else {
            return Err(SimError::UnexpectedEvent {
                time: now,
                location: self.nodes[id.index()].name().to_owned(),
                action: ActionKind::PutPart,
                message: "put_part without a reserved receiver".into(),
            });
        };

        let receiver_name = self.nodes[receiver.index()].name().to_owned();
        match &mut self.nodes[receiver.index()] {
            Node::Buffer(buffer) => buffer.put(now, collect)?,
            Node::Sink(sink) => sink.put(past_warm_up),
            Node::Machine(machine) => machine.accept_part(now)?,
            Node::Source(_) => {
                return Err(SimError::UnexpectedEvent {
                    time: now,
                    location: receiver_name,
                    action: ActionKind::PutPart,
                    message: "cannot push a part into a source".into(),
                });
            }
        }

        let name = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            machine.has_part = false;
            machine.has_finished_part = false;
            machine.blocked = false;
            machine.count_part(now, past_warm_up, collect);
            machine.name.clone()
        };
        self.env.schedule(
            now,
            EventTarget::Node(id),
            ActionKind::RequestPart,
            format!("{name}.put_part at {now}"),
        );

        // The receiver just gained a unit: starved machines below a buffer
        // can retry, and a machine receiver starts its cycle.
        let receiver_is_buffer = matches!(self.nodes[receiver.index()], Node::Buffer(_));
        let receiver_is_machine = matches!(self.nodes[receiver.index()], Node::Machine(_));
        if receiver_is_buffer {
            self.wake_receivers_of(receiver, &receiver_name);
        } else if receiver_is_machine {
            let cycle = {
                let distribution = machine_in(&self.nodes, receiver, now)?.cycle_time;
                distribution.sample(self.env.rng_mut())
            };
            machine_mut_in(&mut self.nodes, receiver, now)?.remaining_process_time = cycle;
            self.env.schedule(
                now + cycle,
                EventTarget::Node(receiver),
                ActionKind::RequestSpace,
                format!("{receiver_name}.put_part at {now}"),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Machine health handlers
    // ------------------------------------------------------------------

    fn degrade(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let collect = self.env.collect_data();
        let (name, health, failed_state, threshold) = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            if machine.failed || machine.under_repair {
                return Ok(());
            }
            machine.health = (machine.health + 1).min(machine.failed_state());
            machine.record_health(now, collect);
            (
                machine.name.clone(),
                machine.health,
                machine.failed_state(),
                machine.cbm_threshold(),
            )
        };
        let tag = format!("{name}.degrade at {now}");

        if health == failed_state {
            self.env
                .schedule(now, EventTarget::Node(id), ActionKind::Fail, tag);
            return Ok(());
        }

        if health == threshold {
            self.env
                .schedule(now, EventTarget::Node(id), ActionKind::EnterQueue, tag.clone());
        }
        let time_to_degrade =
            machine_in(&self.nodes, id, now)?.sample_time_to_degrade(self.env.rng_mut());
        if let Some(ttd) = time_to_degrade {
            self.env
                .schedule(now + ttd, EventTarget::Node(id), ActionKind::Degrade, tag);
        }
        Ok(())
    }

    fn enter_queue(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let (name, failed) = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            if machine.under_repair {
                return Ok(());
            }
            // Keep the earliest entry of this degradation cycle.
            machine.time_entered_queue.get_or_insert(now);
            machine.in_queue = true;
            (machine.name.clone(), machine.failed)
        };
        debug!(machine = %name, time = now, "entered maintenance queue");

        if !failed && self.maintainer.has_capacity() {
            self.env.schedule(
                now,
                EventTarget::Maintainer,
                ActionKind::Inspect,
                format!("{name}.enter_queue at {now}"),
            );
        }
        Ok(())
    }

    fn fail(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let collect = self.env.collect_data();
        let name = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            if machine.under_repair {
                return Ok(());
            }
            machine.failed = true;
            machine.failed_at = Some(now);
            machine.health = machine.failed_state();
            machine.downtime_start.get_or_insert(now);
            if !machine.in_queue {
                machine.time_entered_queue.get_or_insert(now);
                machine.in_queue = true;
            }
            machine.record_health(now, collect);
            machine.name.clone()
        };
        debug!(machine = %name, time = now, "failed");

        // Stale production events must not fire during downtime.
        self.release_flow_targets(id)?;
        self.env.cancel_events_for(EventTarget::Node(id));

        if self.maintainer.has_capacity() {
            self.env.schedule(
                now,
                EventTarget::Maintainer,
                ActionKind::Inspect,
                format!("{name}.fail at {now}"),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance handlers
    // ------------------------------------------------------------------

    fn inspect(&mut self) -> Result<(), SimError> {
        let now = self.env.now();
        // Under capacity > 1 keep dispatching until the queue drains or the
        // technician pool saturates.
        loop {
            if !self.maintainer.has_capacity() {
                return Ok(());
            }
            let queue: Vec<MaintenanceRequest> = self
                .machines
                .iter()
                .filter_map(|&id| {
                    let Node::Machine(machine) = &self.nodes[id.index()] else {
                        return None;
                    };
                    (machine.in_queue && !machine.under_repair).then(|| MaintenanceRequest {
                        machine: id,
                        name: machine.name.clone(),
                        time_entered_queue: machine.time_entered_queue.unwrap_or(now),
                        failed: machine.failed,
                        health: machine.health,
                        expected_repair_time: machine.expected_repair_time(),
                        selection_priority: machine.selection_priority,
                    })
                })
                .collect();
            if queue.is_empty() {
                return Ok(());
            }

            let chosen = self.maintainer.choose(&queue, self.env.rng_mut());
            if !queue.iter().any(|request| request.machine == chosen) {
                return Err(SimError::InvariantViolation {
                    time: now,
                    location: "maintainer".into(),
                    message: format!(
                        "policy `{}` chose a machine that is not in the queue",
                        self.maintainer.policy_name()
                    ),
                });
            }

            self.maintainer.begin_repair();
            {
                let machine = machine_mut_in(&mut self.nodes, chosen, now)?;
                machine.in_queue = false;
                machine.under_repair = true;
            }
            self.env.schedule(
                now,
                EventTarget::Node(chosen),
                ActionKind::Maintain,
                format!("maintainer.inspect at {now}"),
            );
        }
    }

    fn maintain(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        {
            let machine = machine_in(&self.nodes, id, now)?;
            if !machine.under_repair || machine.active_repair.is_some() {
                return Err(SimError::UnexpectedEvent {
                    time: now,
                    location: machine.name.clone(),
                    action: ActionKind::Maintain,
                    message: "maintain on a machine the maintainer did not dispatch".into(),
                });
            }
        }

        self.release_flow_targets(id)?;
        self.env.cancel_events_for(EventTarget::Node(id));

        let (kind, duration) = {
            let machine = machine_in(&self.nodes, id, now)?;
            machine.sample_repair(self.env.rng_mut())
        };
        let name = self.begin_repair_on(id, kind, duration, now)?;
        debug!(machine = %name, time = now, ?kind, duration, "repair started");

        self.env.schedule(
            now + duration,
            EventTarget::Node(id),
            ActionKind::Restore,
            format!("{name}.maintain at {now}"),
        );
        Ok(())
    }

    fn maintain_planned_failure(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let (name, duration) = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            if machine.under_repair || machine.failed {
                debug!(machine = %machine.name, time = now, "planned failure skipped; machine already down");
                return Ok(());
            }
            let Some(planned) = machine.planned_failure() else {
                return Ok(());
            };
            machine.under_repair = true;
            machine.in_queue = false;
            (machine.name.clone(), planned.duration)
        };

        self.release_flow_targets(id)?;
        self.env.cancel_events_for(EventTarget::Node(id));
        self.begin_repair_on(id, RepairKind::Planned, duration, now)?;
        debug!(machine = %name, time = now, duration, "planned outage started");

        self.env.schedule(
            now + duration,
            EventTarget::Node(id),
            ActionKind::Restore,
            format!("{name}.maintain_planned_failure at {now}"),
        );
        Ok(())
    }

    /// Shared repair entry: drop the current part, stamp downtime, and
    /// record the maintenance event.
    fn begin_repair_on(
        &mut self,
        id: NodeId,
        kind: RepairKind,
        duration: u64,
        now: u64,
    ) -> Result<String, SimError> {
        let machine = machine_mut_in(&mut self.nodes, id, now)?;
        machine.has_part = false;
        machine.has_finished_part = false;
        machine.remaining_process_time = 0;
        machine.starved = false;
        machine.blocked = false;
        machine.in_queue = false;
        machine.downtime_start.get_or_insert(now);
        machine.active_repair = Some(kind);
        machine.record_maintenance(MaintenanceRecord {
            time: now,
            kind,
            duration,
        });
        Ok(machine.name.clone())
    }

    fn restore(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.env.now();
        let collect = self.env.collect_data();
        let (name, kind) = {
            let machine = machine_mut_in(&mut self.nodes, id, now)?;
            if !machine.under_repair {
                return Err(SimError::UnexpectedEvent {
                    time: now,
                    location: machine.name.clone(),
                    action: ActionKind::Restore,
                    message: "restore on a machine that is not under repair".into(),
                });
            }
            machine.health = 0;
            machine.failed = false;
            machine.failed_at = None;
            machine.under_repair = false;
            machine.in_queue = false;
            machine.time_entered_queue = None;
            if let Some(start) = machine.downtime_start.take() {
                machine.downtime += now - start;
            }
            machine.record_health(now, collect);
            (machine.name.clone(), machine.active_repair.take())
        };
        debug!(machine = %name, time = now, "restored to perfect health");

        // Planned outages never held a technician.
        if kind != Some(RepairKind::Planned) {
            self.maintainer.end_repair();
        }

        let tag = format!("{name}.restore at {now}");
        let time_to_degrade =
            machine_in(&self.nodes, id, now)?.sample_time_to_degrade(self.env.rng_mut());
        if let Some(ttd) = time_to_degrade {
            self.env
                .schedule(now + ttd, EventTarget::Node(id), ActionKind::Degrade, tag.clone());
        }
        self.env
            .schedule(now, EventTarget::Node(id), ActionKind::RequestPart, tag.clone());
        self.env
            .schedule(now, EventTarget::Maintainer, ActionKind::Inspect, tag);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invariants and results
    // ------------------------------------------------------------------

    /// Verifies the core state invariants after every executed event.
    fn check_invariants(&self) -> Result<(), SimError> {
        let now = self.env.now();
        let mut active_repairs = 0;
        for node in &self.nodes {
            match node {
                Node::Buffer(buffer) => {
                    if buffer.level() > buffer.capacity
                        || buffer.reserved_content() > buffer.level()
                        || buffer.reserved_vacancy() > buffer.capacity - buffer.level()
                    {
                        return Err(SimError::InvariantViolation {
                            time: now,
                            location: buffer.name.clone(),
                            message: format!(
                                "buffer out of bounds: level {} / capacity {}, reserved content {}, reserved vacancy {}",
                                buffer.level(),
                                buffer.capacity,
                                buffer.reserved_content(),
                                buffer.reserved_vacancy()
                            ),
                        });
                    }
                }
                Node::Machine(machine) => {
                    if machine.under_repair && machine.in_queue {
                        return Err(SimError::InvariantViolation {
                            time: now,
                            location: machine.name.clone(),
                            message: "machine is both queued and under repair".into(),
                        });
                    }
                    if machine.failed && machine.health != machine.failed_state() {
                        return Err(SimError::InvariantViolation {
                            time: now,
                            location: machine.name.clone(),
                            message: format!(
                                "failed machine has health {} of {}",
                                machine.health,
                                machine.failed_state()
                            ),
                        });
                    }
                    if machine.under_repair && machine.active_repair != Some(RepairKind::Planned)
                    {
                        active_repairs += 1;
                    }
                }
                Node::Source(_) | Node::Sink(_) => {}
            }
        }
        if active_repairs != self.maintainer.utilization() {
            return Err(SimError::InvariantViolation {
                time: now,
                location: "maintainer".into(),
                message: format!(
                    "utilization {} disagrees with {} active repairs",
                    self.maintainer.utilization(),
                    active_repairs
                ),
            });
        }
        Ok(())
    }

    /// Machines still down at termination accrue their open downtime.
    fn close_downtime(&mut self) {
        let now = self.env.now();
        for &id in &self.machines.clone() {
            if let Node::Machine(machine) = &mut self.nodes[id.index()]
                && (machine.failed || machine.under_repair)
                && let Some(start) = machine.downtime_start.take()
            {
                machine.downtime += now - start;
            }
        }
    }

    fn summarize(&self, options: &RunOptions) -> RunSummary {
        let total_time = options.horizon();
        let mut machine_production = Vec::with_capacity(self.machines.len());
        let mut machine_availability = Vec::with_capacity(self.machines.len());
        for &id in &self.machines {
            if let Node::Machine(machine) = &self.nodes[id.index()] {
                machine_production.push(machine.parts_made());
                machine_availability.push(machine.availability(total_time));
            }
        }
        RunSummary {
            seed: options.seed,
            final_time: self.env.now(),
            events_executed: self.env.events_dequeued(),
            production: self.production(),
            machine_production,
            machine_availability,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
