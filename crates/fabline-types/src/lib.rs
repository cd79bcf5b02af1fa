//! # fabline-types: Core types for Fabline
//!
//! This crate contains the value types shared across the Fabline simulator:
//! - Integer duration distributions ([`Distribution`]) and their on-disk
//!   spec format ([`DistributionSpec`])
//! - Markovian health degradation ([`DegradationMatrix`])
//! - Spec validation errors ([`SpecError`])
//!
//! Simulation time is a plain `u64` tick count throughout the workspace;
//! distributions sample tick durations and never touch wall-clock time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for row-stochastic checks on floating-point inputs.
const ROW_SUM_EPSILON: f64 = 1e-6;

// ============================================================================
// Errors
// ============================================================================

/// Validation errors raised while interpreting a distribution spec or a
/// degradation matrix. These are configuration errors: they surface before
/// any simulation event is scheduled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpecError {
    #[error("distribution spec must contain exactly one of `constant`, `uniform`, or `geometric`")]
    AmbiguousDistribution,

    #[error("uniform bounds are inverted: [{low}, {high}]")]
    InvertedUniform { low: u64, high: u64 },

    #[error("geometric success probability must lie in (0, 1], got {0}")]
    InvalidProbability(f64),

    #[error("degradation matrix must be square and non-empty ({rows} rows, row {row} has width {width})")]
    NotSquare {
        rows: usize,
        row: usize,
        width: usize,
    },

    #[error("degradation matrix row {row} sums to {sum}, expected 1")]
    RowNotStochastic { row: usize, sum: f64 },

    #[error("degradation matrix row {row} contains a negative entry")]
    NegativeEntry { row: usize },
}

// ============================================================================
// Distributions
// ============================================================================

/// A sampled integer duration.
///
/// Exactly three families are supported: a degenerate constant, the discrete
/// uniform over an inclusive range, and the geometric number-of-trials
/// distribution (support starting at 1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DistributionSpec", into = "DistributionSpec")]
pub enum Distribution {
    /// Always returns `k`.
    Constant(u64),
    /// Uniform over `[low, high]`, both ends inclusive.
    Uniform(u64, u64),
    /// Number of Bernoulli trials until the first success with probability `p`.
    Geometric(f64),
}

impl Distribution {
    /// Validated constructor for the uniform family.
    pub fn uniform(low: u64, high: u64) -> Result<Self, SpecError> {
        if low > high {
            return Err(SpecError::InvertedUniform { low, high });
        }
        Ok(Distribution::Uniform(low, high))
    }

    /// Validated constructor for the geometric family.
    pub fn geometric(p: f64) -> Result<Self, SpecError> {
        if !(p > 0.0 && p <= 1.0) {
            return Err(SpecError::InvalidProbability(p));
        }
        Ok(Distribution::Geometric(p))
    }

    /// Re-checks the variant parameters. Used after deserializing through
    /// an external spec where the variants are built directly.
    pub fn validate(&self) -> Result<(), SpecError> {
        match *self {
            Distribution::Constant(_) => Ok(()),
            Distribution::Uniform(low, high) => {
                Self::uniform(low, high)?;
                Ok(())
            }
            Distribution::Geometric(p) => {
                Self::geometric(p)?;
                Ok(())
            }
        }
    }

    /// Draws one integer duration.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        match *self {
            Distribution::Constant(k) => k,
            Distribution::Uniform(low, high) => rng.gen_range(low..=high),
            Distribution::Geometric(p) => {
                if p >= 1.0 {
                    1
                } else {
                    // Inverse-CDF draw; support is {1, 2, ...}.
                    let u: f64 = rng.r#gen();
                    1 + ((1.0 - u).ln() / (1.0 - p).ln()).floor() as u64
                }
            }
        }
    }

    /// Expected value, for policies that rank by expected duration.
    pub fn mean(&self) -> f64 {
        match *self {
            Distribution::Constant(k) => k as f64,
            Distribution::Uniform(low, high) => (low + high) as f64 / 2.0,
            Distribution::Geometric(p) => 1.0 / p,
        }
    }
}

// ============================================================================
// Distribution spec format
// ============================================================================

/// The serialized form of a [`Distribution`].
///
/// A spec is either a bare integer (shorthand for `constant`) or a mapping
/// with exactly one of the three family keys:
///
/// ```toml
/// cycle_time = 3                        # constant shorthand
/// pm_time = { geometric = 0.25 }
/// cm_time = { uniform = [5, 15] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistributionSpec {
    /// Bare integer shorthand for `Constant`.
    Shorthand(u64),
    /// Explicit single-key mapping.
    Table(DistributionTable),
}

/// The mapping form of a distribution spec. Exactly one field may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniform: Option<[u64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometric: Option<f64>,
}

impl TryFrom<DistributionSpec> for Distribution {
    type Error = SpecError;

    fn try_from(spec: DistributionSpec) -> Result<Self, Self::Error> {
        match spec {
            DistributionSpec::Shorthand(k) => Ok(Distribution::Constant(k)),
            DistributionSpec::Table(table) => {
                match (table.constant, table.uniform, table.geometric) {
                    (Some(k), None, None) => Ok(Distribution::Constant(k)),
                    (None, Some([low, high]), None) => Distribution::uniform(low, high),
                    (None, None, Some(p)) => Distribution::geometric(p),
                    _ => Err(SpecError::AmbiguousDistribution),
                }
            }
        }
    }
}

impl From<Distribution> for DistributionSpec {
    fn from(dist: Distribution) -> Self {
        let table = match dist {
            Distribution::Constant(k) => DistributionTable {
                constant: Some(k),
                ..DistributionTable::default()
            },
            Distribution::Uniform(low, high) => DistributionTable {
                uniform: Some([low, high]),
                ..DistributionTable::default()
            },
            Distribution::Geometric(p) => DistributionTable {
                geometric: Some(p),
                ..DistributionTable::default()
            },
        };
        DistributionSpec::Table(table)
    }
}

// ============================================================================
// Degradation matrix
// ============================================================================

/// Row-stochastic transition kernel over discrete health states.
///
/// Health `0` is as-good-as-new; the last state is the failed state. The
/// chain advances one tick per `degrade` event; a machine leaves its current
/// health state after a row-dependent geometric number of ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct DegradationMatrix {
    rows: Vec<Vec<f64>>,
}

impl DegradationMatrix {
    /// Validates and wraps a square row-stochastic matrix.
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self, SpecError> {
        let dim = rows.len();
        if dim == 0 {
            return Err(SpecError::NotSquare {
                rows: 0,
                row: 0,
                width: 0,
            });
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(SpecError::NotSquare {
                    rows: dim,
                    row: i,
                    width: row.len(),
                });
            }
            if row.iter().any(|&p| p < 0.0) {
                return Err(SpecError::NegativeEntry { row: i });
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_EPSILON {
                return Err(SpecError::RowNotStochastic { row: i, sum });
            }
        }
        Ok(Self { rows })
    }

    /// The identity matrix of the given dimension: a machine that never
    /// degrades.
    pub fn identity(dim: usize) -> Self {
        let rows = (0..dim)
            .map(|i| {
                let mut row = vec![0.0; dim];
                row[i] = 1.0;
                row
            })
            .collect();
        Self { rows }
    }

    /// A birth chain where every non-failed state moves to its successor
    /// with probability `q` and stays put otherwise. The failed state is
    /// absorbing.
    pub fn upper_bidiagonal(dim: usize, q: f64) -> Result<Self, SpecError> {
        if !(0.0..=1.0).contains(&q) {
            return Err(SpecError::InvalidProbability(q));
        }
        let mut rows = vec![vec![0.0; dim]; dim];
        for (i, row) in rows.iter_mut().enumerate() {
            if i + 1 < dim {
                row[i] = 1.0 - q;
                row[i + 1] = q;
            } else {
                row[i] = 1.0;
            }
        }
        Self::new(rows)
    }

    /// Number of health states.
    pub fn dim(&self) -> usize {
        self.rows.len()
    }

    /// Index of the failed (last) state.
    pub fn failed_state(&self) -> usize {
        self.rows.len() - 1
    }

    /// One transition row.
    pub fn row(&self, state: usize) -> &[f64] {
        &self.rows[state]
    }

    /// True when the state's self-loop probability is 1: the chain can
    /// never leave it.
    pub fn is_absorbing(&self, state: usize) -> bool {
        (self.rows[state][state] - 1.0).abs() <= ROW_SUM_EPSILON
    }

    /// Samples the successor state of `state` according to its row.
    pub fn sample_next<R: Rng + ?Sized>(&self, state: usize, rng: &mut R) -> usize {
        let row = &self.rows[state];
        let u: f64 = rng.r#gen();
        let mut acc = 0.0;
        for (next, &p) in row.iter().enumerate() {
            acc += p;
            if u < acc {
                return next;
            }
        }
        // Row sums to 1 within tolerance; attribute residual mass to the
        // last state.
        row.len() - 1
    }

    /// Number of row draws until the chain first leaves `state`, or `None`
    /// if the state is absorbing.
    ///
    /// This is the machine's time-to-degrade from its current health: each
    /// draw models one tick of the underlying chain.
    pub fn sample_holding_time<R: Rng + ?Sized>(
        &self,
        state: usize,
        rng: &mut R,
    ) -> Option<u64> {
        if self.is_absorbing(state) {
            return None;
        }
        let mut ticks = 1;
        while self.sample_next(state, rng) == state {
            ticks += 1;
        }
        Some(ticks)
    }
}

impl TryFrom<Vec<Vec<f64>>> for DegradationMatrix {
    type Error = SpecError;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        Self::new(rows)
    }
}

impl From<DegradationMatrix> for Vec<Vec<f64>> {
    fn from(matrix: DegradationMatrix) -> Self {
        matrix.rows
    }
}

// ============================================================================
// Tests
// ============================================================================
