use serde::Deserialize;

use crate::error::ConfigError;

/// Settings shared by the registry and the tracer.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// # use sigil::Config;
/// let config = Config::from_json(r#"{ "max_history": 8 }"#).unwrap();
/// assert_eq!(config.max_history, 8);
/// assert_eq!(config.max_trace_depth, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on hops for every backward traversal.
    pub max_trace_depth: usize,
    /// How many runs are kept before the oldest is evicted.
    pub max_history: usize,
    /// Reuse records of nodes the host skipped re-executing.
    pub node_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_trace_depth: 64,
            max_history: 3,
            node_cache: true,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_trace_depth == 0 {
            return Err(ConfigError::Zero("max_trace_depth"));
        }
        if self.max_history == 0 {
            return Err(ConfigError::Zero("max_history"));
        }
        Ok(())
    }

    pub fn with_max_trace_depth(mut self, depth: usize) -> Self {
        self.max_trace_depth = depth;
        self
    }

    pub fn with_max_history(mut self, runs: usize) -> Self {
        self.max_history = runs;
        self
    }

    pub fn with_node_cache(mut self, enabled: bool) -> Self {
        self.node_cache = enabled;
        self
    }
}
