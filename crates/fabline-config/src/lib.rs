//! Configuration surface for Fabline.
//!
//! A whole production line is described in one TOML file: sources, machines,
//! buffers, sinks, the maintainer, and the connections between nodes by
//! name. [`LineConfig::load`] parses and validates the file;
//! [`LineConfig::build`] wires up a runnable [`fabline::System`].
//!
//! ```toml
//! [maintainer]
//! capacity = 1
//!
//! [[source]]
//! name = "input"
//!
//! [[machine]]
//! name = "M1"
//! cycle_time = 3
//! degradation = [[0.9, 0.1], [0.0, 1.0]]
//! cbm_threshold = 1
//! pm_time = { geometric = 0.25 }
//! cm_time = { constant = 10 }
//!
//! [[sink]]
//! name = "output"
//!
//! [[connection]]
//! from = "input"
//! to = "M1"
//!
//! [[connection]]
//! from = "M1"
//! to = "output"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use fabline::{Buffer, Machine, Maintainer, NodeId, Sink, Source, System, SystemBuilder};
use fabline_types::{DegradationMatrix, Distribution};

mod error;

pub use error::ConfigError;

// ============================================================================
// Config model
// ============================================================================

/// One production line, as described on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LineConfig {
    pub maintainer: MaintainerConfig,
    pub source: Vec<SourceConfig>,
    pub machine: Vec<MachineConfig>,
    pub buffer: Vec<BufferConfig>,
    pub sink: Vec<SinkConfig>,
    pub connection: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintainerConfig {
    /// Number of repair technicians; absent means unbounded.
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// One arrival every `interarrival` ticks; absent means unlimited supply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interarrival: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    pub name: String,
    pub cycle_time: Distribution,
    /// Row-stochastic health transition matrix; absent means the machine
    /// never degrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Vec<Vec<f64>>>,
    /// Health at which preventive repair is requested; absent means pure
    /// corrective maintenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbm_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_time: Option<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cm_time: Option<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_failure: Option<PlannedFailureConfig>,
    #[serde(default)]
    pub initial_health: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_remaining_process: Option<u64>,
    #[serde(default)]
    pub selection_priority: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannedFailureConfig {
    pub time: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    pub name: String,
    pub capacity: u64,
    #[serde(default)]
    pub initial_level: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub name: String,
    #[serde(default)]
    pub initial_level: u64,
}

/// Directed part flow between two named nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    pub from: String,
    pub to: String,
}

// ============================================================================
// Loading and building
// ============================================================================

impl LineConfig {
    /// Reads and parses a TOML line description.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Parses a TOML line description from a string.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::ParseText(Box::new(source)))
    }

    /// Validates the description and wires up a runnable system.
    pub fn build(&self) -> Result<System, ConfigError> {
        self.validate()?;

        let mut builder = SystemBuilder::new();
        let mut ids: HashMap<String, NodeId> = HashMap::new();

        for source in &self.source {
            let mut node = Source::new(source.name.clone());
            if let Some(interarrival) = source.interarrival {
                node = node.with_interarrival(interarrival);
            }
            ids.insert(source.name.clone(), builder.add_source(node));
        }
        for machine in &self.machine {
            ids.insert(machine.name.clone(), builder.add_machine(machine.to_machine()?));
        }
        for buffer in &self.buffer {
            let node = Buffer::new(buffer.name.clone(), buffer.capacity)
                .with_initial_level(buffer.initial_level);
            ids.insert(buffer.name.clone(), builder.add_buffer(node));
        }
        for sink in &self.sink {
            let mut node = Sink::new(sink.name.clone());
            node.initial_level = sink.initial_level;
            ids.insert(sink.name.clone(), builder.add_sink(node));
        }

        for connection in &self.connection {
            let from = *ids
                .get(&connection.from)
                .ok_or_else(|| ConfigError::UnknownNode(connection.from.clone()))?;
            let to = *ids
                .get(&connection.to)
                .ok_or_else(|| ConfigError::UnknownNode(connection.to.clone()))?;
            builder.connect(from, to);
        }

        builder.maintainer(Maintainer::new(self.maintainer.capacity));
        Ok(builder.build()?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.is_empty() {
            return Err(ConfigError::Validation(
                "a line needs at least one machine".into(),
            ));
        }
        if let Some(0) = self.maintainer.capacity {
            warn!("maintainer capacity 0: machines will never be repaired");
        }
        for source in &self.source {
            if source.interarrival == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "source `{}` has a zero interarrival time",
                    source.name
                )));
            }
        }
        for machine in &self.machine {
            if let Some(threshold) = machine.cbm_threshold
                && threshold == 0
            {
                return Err(ConfigError::Validation(format!(
                    "machine `{}` has a CBM threshold of 0; use 1 or omit it",
                    machine.name
                )));
            }
        }
        Ok(())
    }
}

impl MachineConfig {
    fn to_machine(&self) -> Result<Machine, ConfigError> {
        let mut machine = Machine::new(self.name.clone(), self.cycle_time)
            .with_initial_health(self.initial_health)
            .with_selection_priority(self.selection_priority);

        if let Some(rows) = &self.degradation {
            let matrix = DegradationMatrix::new(rows.clone())?;
            machine = machine.with_degradation(matrix, self.cbm_threshold);
        } else if self.cbm_threshold.is_some() {
            return Err(ConfigError::Validation(format!(
                "machine `{}` sets a CBM threshold without a degradation matrix",
                self.name
            )));
        }

        if self.pm_time.is_some() || self.cm_time.is_some() {
            let pm = self.pm_time.unwrap_or(Distribution::Constant(1));
            let cm = self.cm_time.unwrap_or(Distribution::Constant(1));
            machine = machine.with_maintenance(pm, cm);
        }

        if let Some(planned) = self.planned_failure {
            machine = machine.with_planned_failure(planned.time, planned.duration);
        }
        if let Some(remaining) = self.initial_remaining_process {
            machine = machine.with_initial_remaining_process(remaining);
        }
        Ok(machine)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fabline::RunOptions;

    const TWO_MACHINE_LINE: &str = r#"
        [maintainer]
        capacity = 1

        [[source]]
        name = "input"

        [[machine]]
        name = "M1"
        cycle_time = 1

        [[machine]]
        name = "M2"
        cycle_time = { uniform = [1, 3] }
        degradation = [
            [0.9, 0.1, 0.0],
            [0.0, 0.9, 0.1],
            [0.0, 0.0, 1.0],
        ]
        cbm_threshold = 1
        pm_time = { geometric = 0.5 }
        cm_time = { constant = 8 }

        [[buffer]]
        name = "B1"
        capacity = 5

        [[sink]]
        name = "output"

        [[connection]]
        from = "input"
        to = "M1"

        [[connection]]
        from = "M1"
        to = "B1"

        [[connection]]
        from = "B1"
        to = "M2"

        [[connection]]
        from = "M2"
        to = "output"
    "#;

    #[test]
    fn parses_and_builds_a_two_machine_line() {
        let config = LineConfig::from_toml(TWO_MACHINE_LINE).expect("parses");
        let mut system = config.build().expect("builds");
        assert_eq!(system.machine_ids().len(), 2);
        assert_eq!(system.maintainer().capacity(), Some(1));

        let summary = system
            .simulate(&RunOptions::new(200).with_seed(3))
            .expect("runs");
        assert!(summary.production > 0);
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("line.toml");
        std::fs::write(&path, TWO_MACHINE_LINE).expect("write config");

        let config = LineConfig::load(&path).expect("loads");
        assert_eq!(config.machine.len(), 2);
    }

    #[test]
    fn load_reports_missing_file_with_path() {
        let err = LineConfig::load("/nonexistent/line.toml").expect_err("missing file");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn rejects_unknown_connection_endpoint() {
        let config = LineConfig::from_toml(
            r#"
            [[source]]
            name = "input"

            [[machine]]
            name = "M1"
            cycle_time = 1

            [[sink]]
            name = "output"

            [[connection]]
            from = "input"
            to = "mystery"
            "#,
        )
        .expect("parses");
        assert!(matches!(
            config.build(),
            Err(ConfigError::UnknownNode(name)) if name == "mystery"
        ));
    }

    #[test]
    fn rejects_bad_degradation_rows() {
        let config = LineConfig::from_toml(
            r#"
            [[source]]
            name = "input"

            [[machine]]
            name = "M1"
            cycle_time = 1
            degradation = [[0.5, 0.1], [0.0, 1.0]]

            [[sink]]
            name = "output"

            [[connection]]
            from = "input"
            to = "M1"

            [[connection]]
            from = "M1"
            to = "output"
            "#,
        )
        .expect("parses");
        assert!(matches!(config.build(), Err(ConfigError::Spec(_))));
    }

    #[test]
    fn rejects_threshold_without_degradation() {
        let config = LineConfig::from_toml(
            r#"
            [[source]]
            name = "input"

            [[machine]]
            name = "M1"
            cycle_time = 1
            cbm_threshold = 2

            [[sink]]
            name = "output"

            [[connection]]
            from = "input"
            to = "M1"

            [[connection]]
            from = "M1"
            to = "output"
            "#,
        )
        .expect("parses");
        assert!(matches!(config.build(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_distribution_key() {
        let err = LineConfig::from_toml(
            r#"
            [[machine]]
            name = "M1"
            cycle_time = { normal = 3.0 }
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_empty_line() {
        let config = LineConfig::from_toml("").expect("parses");
        assert!(matches!(config.build(), Err(ConfigError::Validation(_))));
    }
}
