use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, workspace::WorkspaceStrategy};

/// Engine-wide knobs shared by every runner a [`crate::Context`] builds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Byte alignment of every workspace range. Must be a power of two. The
    /// default matches the strictest storage-buffer offset alignment of the
    /// wgpu backend.
    pub workspace_alignment: u64,
    pub workspace_strategy: WorkspaceStrategy,
    /// Pooled runners kept per graph operation type.
    pub pool_capacity: usize,
    /// Reject views that change a tensor's element count.
    pub check_views: bool,
    /// Log a graphviz rendering of each newly built graph at debug level.
    pub dump_graphs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_alignment: 256,
            workspace_strategy: WorkspaceStrategy::Linear,
            pool_capacity: 64,
            check_views: true,
            dump_graphs: false,
        }
    }
}

impl EngineConfig {
    pub const ALIGNMENT_VAR: &'static str = "KERNEL_GRAPH_WORKSPACE_ALIGNMENT";
    pub const STRATEGY_VAR: &'static str = "KERNEL_GRAPH_WORKSPACE_STRATEGY";
    pub const POOL_CAPACITY_VAR: &'static str = "KERNEL_GRAPH_POOL_CAPACITY";
    pub const CHECK_VIEWS_VAR: &'static str = "KERNEL_GRAPH_CHECK_VIEWS";
    pub const DUMP_GRAPHS_VAR: &'static str = "KERNEL_GRAPH_DUMP_GRAPHS";

    /// Defaults overlaid with any `KERNEL_GRAPH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|var| std::env::var(var).ok())
    }

    /// Overlays values looked up by variable name, then validates.
    pub fn overlay(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(Self::ALIGNMENT_VAR) {
            self.workspace_alignment = parse(Self::ALIGNMENT_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::STRATEGY_VAR) {
            self.workspace_strategy = parse(Self::STRATEGY_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::POOL_CAPACITY_VAR) {
            self.pool_capacity = parse(Self::POOL_CAPACITY_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::CHECK_VIEWS_VAR) {
            self.check_views = parse_flag(Self::CHECK_VIEWS_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::DUMP_GRAPHS_VAR) {
            self.dump_graphs = parse_flag(Self::DUMP_GRAPHS_VAR, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workspace_alignment.is_power_of_two() {
            return Err(ConfigError::Alignment(self.workspace_alignment));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::PoolCapacity);
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}
