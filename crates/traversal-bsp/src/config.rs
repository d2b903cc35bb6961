//! Runtime and program configuration
//!
//! [`ComputerConfig`] tunes the driver. [`ProgramConfiguration`] is the flat
//! key-value map a program stores itself into and is loaded back from.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BspError;

/// Pipeline reference resolved through a `PipelineCatalog`
pub const PIPELINE_KEY: &str = "bsp.pipeline";

/// Step at which a resumed traversal picks up
pub const STEP_ID_KEY: &str = "bsp.stepId";

/// Serialized side-effect arena
pub const SIDE_EFFECTS_KEY: &str = "bsp.sideEffects";

/// How a traversal program seeds its first superstep
pub const SEED_KEY: &str = "bsp.seed";

/// Settings for a [`GraphComputer`](crate::runtime::GraphComputer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputerConfig {
    /// Abort once this many supersteps ran without terminating
    pub max_supersteps: usize,

    /// Worker tasks per superstep
    pub parallelism: usize,

    /// Fold memory contributions in two orders at each barrier and compare
    pub verify_merges: bool,

    /// Checkpoint every N supersteps; `None` disables checkpointing
    pub checkpoint_interval: Option<usize>,

    /// Supersteps slower than this are logged at warn level
    #[serde(with = "humantime_serde")]
    pub slow_superstep_threshold: Duration,
}

impl Default for ComputerConfig {
    fn default() -> Self {
        Self {
            max_supersteps: 1000,
            parallelism: num_cpus::get(),
            verify_merges: true,
            checkpoint_interval: None,
            slow_superstep_threshold: Duration::from_secs(5),
        }
    }
}

impl ComputerConfig {
    pub fn with_max_supersteps(mut self, max: usize) -> Self {
        self.max_supersteps = max;
        self
    }

    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers;
        self
    }

    pub fn with_verify_merges(mut self, verify: bool) -> Self {
        self.verify_merges = verify;
        self
    }

    pub fn with_checkpoint_interval(mut self, every: usize) -> Self {
        self.checkpoint_interval = Some(every);
        self
    }

    pub fn with_slow_superstep_threshold(mut self, threshold: Duration) -> Self {
        self.slow_superstep_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), BspError> {
        if self.max_supersteps == 0 {
            return Err(BspError::config("max_supersteps must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(BspError::config("parallelism must be at least 1"));
        }
        if self.checkpoint_interval == Some(0) {
            return Err(BspError::config("checkpoint_interval must be at least 1"));
        }
        Ok(())
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, BspError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, BspError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Flat string map a program persists itself into
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramConfiguration {
    entries: BTreeMap<String, String>,
}

impl ProgramConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Like [`get`](Self::get), but a missing key is a configuration error
    pub fn require(&self, key: &str) -> Result<&str, BspError> {
        self.get(key)
            .ok_or_else(|| BspError::config(format!("missing configuration key '{key}'")))
    }

    /// Parse an optional scalar
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, BspError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| BspError::config(format!("bad value for '{key}': {e}")))
            })
            .transpose()
    }

    /// Store a structured value as embedded JSON
    pub fn set_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), BspError> {
        self.set(key, serde_json::to_string(value)?);
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BspError> {
        self.get(key)
            .map(|raw| serde_json::from_str(raw).map_err(BspError::from))
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String, BspError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, BspError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ComputerConfig::default();
        assert_eq!(config.max_supersteps, 1000);
        assert!(config.parallelism >= 1);
        assert!(config.verify_merges);
        assert_eq!(config.slow_superstep_threshold, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_humantime() {
        let config = ComputerConfig::from_yaml_str(
            "max_supersteps: 20\nparallelism: 2\nslow_superstep_threshold: 250ms\n",
        )
        .unwrap();
        assert_eq!(config.max_supersteps, 20);
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.slow_superstep_threshold, Duration::from_millis(250));
        assert!(config.verify_merges);
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        assert!(ComputerConfig::default().with_parallelism(0).validate().is_err());
        assert!(ComputerConfig::default().with_max_supersteps(0).validate().is_err());
        assert!(ComputerConfig::from_json(r#"{"checkpoint_interval": 0}"#).is_err());
        assert!(matches!(
            ComputerConfig::from_yaml_str("max_supersteps: [1"),
            Err(BspError::Configuration(_))
        ));
    }

    #[test]
    fn test_program_configuration_accessors() {
        let mut conf = ProgramConfiguration::new();
        conf.set(PIPELINE_KEY, "g.V()");
        conf.set("limit", "12");
        conf.set("broken", "twelve");

        assert_eq!(conf.require(PIPELINE_KEY).unwrap(), "g.V()");
        assert!(conf.require(STEP_ID_KEY).is_err());
        assert_eq!(conf.parse::<usize>("limit").unwrap(), Some(12));
        assert_eq!(conf.parse::<usize>("missing").unwrap(), None);
        assert!(conf.parse::<usize>("broken").is_err());
    }

    #[test]
    fn test_program_configuration_json() {
        let mut conf = ProgramConfiguration::new();
        conf.set(STEP_ID_KEY, "2.0.1");
        conf.set_json("weights", &vec![1, 2, 3]).unwrap();

        let restored = ProgramConfiguration::from_json(&conf.to_json().unwrap()).unwrap();
        assert_eq!(restored, conf);
        assert_eq!(restored.get_json::<Vec<i32>>("weights").unwrap(), Some(vec![1, 2, 3]));
    }
}
