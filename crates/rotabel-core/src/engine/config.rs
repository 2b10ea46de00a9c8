use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("file I/O error for '{path}': {message}")]
    Io { path: String, message: String },

    #[error("TOML parsing error for '{path}': {message}")]
    Toml { path: String, message: String },
}

/// Belief propagation parameters, read once at solver construction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SolverConfig {
    /// Convex-combination weight of the previous message in each update.
    pub damping: f32,
    /// Hard cap on the number of BP sweeps.
    pub max_iter: usize,
    /// Convergence threshold on the max belief deviation between sweeps.
    pub tol: f32,
    /// Number of sweeps performed between convergence checks.
    pub iteration_chunk_size: usize,
}

impl SolverConfig {
    /// Reads the four required attributes from a name-to-value map.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingParameter`] when an attribute is absent, or
    /// [`ConfigError::InvalidParameter`] when a value is out of range.
    pub fn from_params(params: &HashMap<String, f64>) -> Result<Self, ConfigError> {
        let attr = |name: &'static str| {
            params
                .get(name)
                .copied()
                .ok_or(ConfigError::MissingParameter(name))
        };

        let config = Self {
            damping: attr("damping")? as f32,
            max_iter: attr("max_iter")? as usize,
            tol: attr("tol")? as f32,
            iteration_chunk_size: attr("iteration_chunk_size")? as usize,
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_string_lossy().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.damping) {
            return Err(ConfigError::InvalidParameter {
                name: "damping",
                reason: format!("{} is outside [0, 1]", self.damping),
            });
        }
        if self.max_iter == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "max_iter",
                reason: "must be positive".to_string(),
            });
        }
        if !(self.tol > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "tol",
                reason: format!("{} is not positive", self.tol),
            });
        }
        if self.iteration_chunk_size == 0 || self.iteration_chunk_size > self.max_iter {
            return Err(ConfigError::InvalidParameter {
                name: "iteration_chunk_size",
                reason: format!(
                    "{} is not in 1..={}",
                    self.iteration_chunk_size, self.max_iter
                ),
            });
        }
        Ok(())
    }
}
