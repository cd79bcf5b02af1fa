//! Replication driver: independent runs over distinct seeds.
//!
//! Each replication owns a full clone of the system and its own RNG stream;
//! nothing is shared between workers, so fanning out over a thread pool
//! changes wall-clock time only. Seeds are derived as `seed_base + index`,
//! which keeps a replication batch reproducible end to end.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::system::{RunOptions, System, SystemSnapshot};

/// Parameters for a replication batch.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub replications: u64,
    pub warm_up_time: u64,
    pub simulation_time: u64,
    /// Attach a deep end-of-run snapshot to every result. Off by default;
    /// serialization cost dominates when snapshots are not needed.
    pub store_system_state: bool,
    /// Worker threads. `1` runs replications sequentially on the caller's
    /// thread; larger values fan out over a dedicated pool.
    pub jobs: usize,
    pub seed_base: u64,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            replications: 1,
            warm_up_time: 0,
            simulation_time: 0,
            store_system_state: false,
            jobs: 1,
            seed_base: 0,
        }
    }
}

impl ReplicationOptions {
    pub fn new(replications: u64, simulation_time: u64) -> Self {
        Self {
            replications,
            simulation_time,
            ..Self::default()
        }
    }

    pub fn with_warm_up(mut self, warm_up_time: u64) -> Self {
        self.warm_up_time = warm_up_time;
        self
    }

    pub fn with_seed_base(mut self, seed_base: u64) -> Self {
        self.seed_base = seed_base;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_system_state(mut self) -> Self {
        self.store_system_state = true;
        self
    }
}

/// Metrics of one replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationResult {
    pub seed: u64,
    /// Sum of sink levels.
    pub system_production: u64,
    pub machine_production: Vec<u64>,
    pub machine_availability: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SystemSnapshot>,
}

/// Aggregate statistics over a replication batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub replications: u64,
    pub mean_production: f64,
    /// Sample standard deviation of system production.
    pub std_production: f64,
}

/// Runs `options.replications` independent replications of `template`.
///
/// The template itself is never mutated; each worker clones it, seeds it
/// distinctly, and returns its result tuple. Results arrive in seed order.
pub fn iterate_simulation(
    template: &System,
    options: &ReplicationOptions,
) -> Result<Vec<ReplicationResult>, SimError> {
    let run_one = |index: u64| -> Result<ReplicationResult, SimError> {
        let mut system = template.clone();
        let seed = options.seed_base.wrapping_add(index);
        let run = RunOptions::new(options.simulation_time)
            .with_warm_up(options.warm_up_time)
            .with_seed(seed);
        let summary = system.simulate(&run)?;
        Ok(ReplicationResult {
            seed,
            system_production: summary.production,
            machine_production: summary.machine_production,
            machine_availability: summary.machine_availability,
            snapshot: options.store_system_state.then(|| system.snapshot(seed)),
        })
    };

    if options.jobs <= 1 {
        (0..options.replications).map(run_one).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs)
            .build()
            .map_err(|error| SimError::Replication(error.to_string()))?;
        pool.install(|| {
            (0..options.replications)
                .into_par_iter()
                .map(run_one)
                .collect()
        })
    }
}

/// Mean and sample standard deviation of system production.
pub fn summarize(results: &[ReplicationResult]) -> ReplicationSummary {
    let n = results.len() as u64;
    if n == 0 {
        return ReplicationSummary {
            replications: 0,
            mean_production: 0.0,
            std_production: 0.0,
        };
    }
    let mean = results
        .iter()
        .map(|result| result.system_production as f64)
        .sum::<f64>()
        / n as f64;
    let std = if n < 2 {
        0.0
    } else {
        let variance = results
            .iter()
            .map(|result| {
                let delta = result.system_production as f64 - mean;
                delta * delta
            })
            .sum::<f64>()
            / (n - 1) as f64;
        variance.sqrt()
    };
    ReplicationSummary {
        replications: n,
        mean_production: mean,
        std_production: std,
    }
}
