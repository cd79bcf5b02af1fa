//! # fabline: manufacturing-line simulation under stochastic degradation
//!
//! Fabline simulates serial and branched production lines whose machines
//! degrade, fail, and compete for a finite pool of repair technicians. It
//! exists to answer maintenance-policy questions: given a condition-based
//! maintenance threshold, a technician pool, and stochastic repair times,
//! what throughput and availability does the line achieve?
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           System façade                          │
//! │  ┌────────────┐  ┌─────────────┐  ┌───────────────────────────┐  │
//! │  │ Environment│  │ EventQueue  │  │ SimRng (deterministic)    │  │
//! │  │ (clock)    │  │ (scheduler) │  │ model + tiebreak stream   │  │
//! │  └────────────┘  └─────────────┘  └───────────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │   Source ──▶ Machine ──▶ Buffer ──▶ Machine ──▶ Sink       │  │
//! │  │        two-phase reservation handoff between stages        │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │   Maintainer: capacity-bounded dispatch over the repair    │  │
//! │  │   queue, pluggable selection policy                        │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is event-driven: actions are posted at integer future ticks
//! and run to completion; a replication is single-threaded and exactly
//! reproducible from its seed. Replications fan out over threads with
//! [`iterate_simulation`].
//!
//! ## Quick start
//!
//! ```
//! use fabline::{Distribution, Machine, RunOptions, Sink, Source, SystemBuilder};
//!
//! let mut builder = SystemBuilder::new();
//! let source = builder.add_source(Source::new("input"));
//! let machine = builder.add_machine(Machine::new("M1", Distribution::Constant(1)));
//! let sink = builder.add_sink(Sink::new("output"));
//! builder.connect(source, machine).connect(machine, sink);
//!
//! let mut system = builder.build().expect("valid line");
//! let summary = system
//!     .simulate(&RunOptions::new(1000).with_seed(42))
//!     .expect("run succeeds");
//! assert_eq!(summary.production, 1000);
//! ```

mod error;
mod event;
mod kernel;
mod machine;
mod maintainer;
mod node;
mod replicate;
mod rng;
mod system;
mod trace;

pub use error::SimError;
pub use event::{ActionKind, Event, EventId, EventQueue, EventTarget};
pub use kernel::Environment;
pub use machine::{Machine, MaintenanceRecord, PlannedFailure, RepairKind};
pub use maintainer::{
    FifoPolicy, LongestRepairFirst, MaintenancePolicy, MaintenanceRequest, Maintainer,
};
pub use node::{Buffer, Node, NodeId, Sink, Source, Stock};
pub use replicate::{
    ReplicationOptions, ReplicationResult, ReplicationSummary, iterate_simulation, summarize,
};
pub use rng::SimRng;
pub use system::{RunOptions, RunSummary, System, SystemBuilder, SystemSnapshot};
pub use trace::{EventTrace, TraceRow};

// The distribution and degradation types live in `fabline-types`; re-export
// them so downstream crates only need one dependency.
pub use fabline_types::{DegradationMatrix, Distribution, DistributionSpec, SpecError};
