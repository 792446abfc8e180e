// ========================================================================================
//
//                         Factorization and solve configuration
//
// ========================================================================================

use crate::blocked::BlockParams;
use crate::types::GramError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GramError {
    fn from(err: ConfigError) -> Self {
        GramError::InvalidConfig(err.to_string())
    }
}

/// How the dense backward phase of a solve is scheduled.
///
/// `Auto` only ever resolves to `Sequential` or `Wavefront`. `ProgressPointer`
/// spins while it waits and is used only when requested explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacksolveStrategy {
    /// `Sequential` below the parallel threshold, `Wavefront` at or above it.
    #[default]
    Auto,
    Sequential,
    /// Pending-count task graph over (row group, column block) tiles.
    Wavefront,
    /// Row groups that spin on their predecessor's published progress. Never
    /// picked by `Auto`.
    ProgressPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    pub strategy: BacksolveStrategy,
    pub column_block: usize,
    pub row_block: usize,
    /// Dense row count from which `Auto` goes parallel.
    pub parallel_threshold: usize,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            strategy: BacksolveStrategy::Auto,
            column_block: 256,
            row_block: 64,
            parallel_threshold: 512,
        }
    }
}

impl SolveConfig {
    /// The concrete strategy for a factor with `dense_rows` dense rows.
    pub fn resolve(&self, dense_rows: usize) -> BacksolveStrategy {
        match self.strategy {
            BacksolveStrategy::Auto if dense_rows < self.parallel_threshold => {
                BacksolveStrategy::Sequential
            }
            BacksolveStrategy::Auto => BacksolveStrategy::Wavefront,
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.column_block == 0 || self.row_block == 0 {
            return Err(ConfigError::Invalid(format!(
                "solve blocks must be positive (column_block = {}, row_block = {})",
                self.column_block, self.row_block
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorConfig {
    /// Column block width of the dense-stage factorization.
    pub block_size: usize,
    /// Worker count for the dense stage; `None` uses every available core.
    pub concurrency: Option<usize>,
    pub min_task_size: usize,
    pub solve: SolveConfig,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            block_size: 10,
            concurrency: None,
            min_task_size: 10_000,
            solve: SolveConfig::default(),
        }
    }
}

impl FactorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Defaults overridden by `GRAMCHOL_CONCURRENCY`, `GRAMCHOL_BLOCK_SIZE` and
    /// `GRAMCHOL_MIN_TASK_SIZE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        if let Some(v) = parse("GRAMCHOL_CONCURRENCY") {
            self.concurrency = Some(v);
        }
        if let Some(v) = parse("GRAMCHOL_BLOCK_SIZE") {
            self.block_size = v;
        }
        if let Some(v) = parse("GRAMCHOL_MIN_TASK_SIZE") {
            self.min_task_size = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive".to_string()));
        }
        if self.concurrency == Some(0) {
            return Err(ConfigError::Invalid(
                "concurrency must be positive when set".to_string(),
            ));
        }
        self.solve.validate()
    }

    pub fn block_params(&self) -> BlockParams {
        BlockParams {
            block_size: self.block_size,
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get).max(1),
            min_task_size: self.min_task_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = FactorConfig::from_toml_str(
            "block_size = 16\n[solve]\nstrategy = \"progress_pointer\"\n",
        )
        .unwrap();
        assert_eq!(config.block_size, 16);
        assert_eq!(config.min_task_size, 10_000);
        assert_eq!(config.solve.strategy, BacksolveStrategy::ProgressPointer);
        assert_eq!(config.solve.row_block, 64);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = FactorConfig::default();
        config.concurrency = Some(3);
        config.solve.strategy = BacksolveStrategy::Wavefront;
        let text = config.to_toml_string().unwrap();
        assert_eq!(FactorConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(matches!(
            FactorConfig::from_toml_str("block_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FactorConfig::from_toml_str("[solve]\ncolumn_block = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FactorConfig::from_toml_str("block_size = \"ten\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn overrides_apply_and_bad_values_fall_back() {
        let vars: HashMap<&str, &str> = [
            ("GRAMCHOL_CONCURRENCY", "4"),
            ("GRAMCHOL_BLOCK_SIZE", "not a number"),
            ("GRAMCHOL_MIN_TASK_SIZE", " 500 "),
        ]
        .into_iter()
        .collect();
        let mut config = FactorConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.concurrency, Some(4));
        assert_eq!(config.block_size, 10);
        assert_eq!(config.min_task_size, 500);
        assert_eq!(config.block_params().concurrency, 4);
    }

    #[test]
    fn auto_strategy_switches_on_the_threshold() {
        let solve = SolveConfig::default();
        assert_eq!(solve.resolve(511), BacksolveStrategy::Sequential);
        assert_eq!(solve.resolve(512), BacksolveStrategy::Wavefront);
        let pinned = SolveConfig {
            strategy: BacksolveStrategy::ProgressPointer,
            ..SolveConfig::default()
        };
        assert_eq!(pinned.resolve(1), BacksolveStrategy::ProgressPointer);
    }

    #[test]
    fn auto_never_picks_the_progress_pointer() {
        for threshold in [0, 1, 64, 512] {
            let solve = SolveConfig {
                parallel_threshold: threshold,
                ..SolveConfig::default()
            };
            for rows in [0, 1, 63, 64, 65, 511, 512, 10_000] {
                assert_ne!(solve.resolve(rows), BacksolveStrategy::ProgressPointer);
            }
        }
    }
}
