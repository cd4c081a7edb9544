use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Marker tree configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MarkerTreeConfig {
    /// Run the full structural self-check after every mutation and panic on
    /// the first violation. Linear in the number of nodes, so meant for
    /// tests and debugging sessions only.
    #[serde(default = "default_false")]
    pub verify_after_mutation: bool,

    /// Emit `trace` records for node insertion, merging and removal
    #[serde(default = "default_false")]
    pub trace_structural_changes: bool,

    /// Number of node slots reserved up front
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

/// Upper bound for `initial_capacity`
pub const MAX_INITIAL_CAPACITY: usize = 1 << 26;

fn default_false() -> bool {
    false
}

fn default_initial_capacity() -> usize {
    64
}

impl Default for MarkerTreeConfig {
    fn default() -> Self {
        Self {
            verify_after_mutation: default_false(),
            trace_structural_changes: default_false(),
            initial_capacity: default_initial_capacity(),
        }
    }
}

impl MarkerTreeConfig {
    /// Configuration that re-verifies the tree after every mutation
    pub fn verifying() -> Self {
        Self {
            verify_after_mutation: true,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: MarkerTreeConfig =
            serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// JSON schema describing the configuration file
    pub fn json_schema() -> Result<serde_json::Value, ConfigError> {
        serde_json::to_value(schemars::schema_for!(MarkerTreeConfig))
            .map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_capacity > MAX_INITIAL_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "initial_capacity must be <= {MAX_INITIAL_CAPACITY}"
            )));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {msg}"),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {msg}"),
            ConfigError::SerializeError(msg) => write!(f, "Serialize error: {msg}"),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
