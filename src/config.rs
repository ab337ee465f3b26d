//! Configuration loading and management.
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//!
//! 1. Environment variables
//! 2. `.sepolicy-analyzer.toml` in current directory
//! 3. `~/.config/sepolicy-analyzer/config.toml`
//! 4. Default values
//!
//! # Configuration File Format
//!
//! ```toml
//! [cond]
//! max_bools = 25               # booleans per conditional expression
//! max_depth = 10               # RPN evaluation stack depth
//!
//! [index]
//! hash_bits = 15               # rule index bucket count is 2^hash_bits
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `SEPOLICY_COND_MAX_BOOLS` | Boolean limit for conditional expressions |
//! | `SEPOLICY_COND_MAX_DEPTH` | Evaluation stack depth limit |
//! | `SEPOLICY_INDEX_HASH_BITS` | Rule index hash size exponent |

use std::{env, fs, path::PathBuf};

use serde::Deserialize;

use crate::error::{AppResult, config_error};

/// Default boolean limit per conditional expression.
///
/// Expressions over more distinct booleans conservatively evaluate to false
/// and never match during semantic comparison; the truth-table sweep would
/// otherwise need 2^k evaluations.
pub const COND_MAX_BOOLS: usize = 25;

/// Default evaluation stack depth for conditional expressions.
pub const COND_EXPR_MAXDEPTH: usize = 10;

/// Default rule index hash size exponent (bucket count is `2^15`).
pub const INDEX_HASH_BITS: u32 = 15;

/// Analysis engine configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub cond:  CondConfig,
    #[serde(default)]
    pub index: IndexConfig
}

/// Conditional expression limits
#[derive(Debug, Clone, Deserialize)]
pub struct CondConfig {
    pub max_bools: usize,
    pub max_depth: usize
}

impl Default for CondConfig {
    fn default() -> Self {
        Self {
            max_bools: COND_MAX_BOOLS,
            max_depth: COND_EXPR_MAXDEPTH
        }
    }
}

/// Rule index sizing
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    pub hash_bits: u32
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hash_bits: INDEX_HASH_BITS
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from file and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file in current directory (.sepolicy-analyzer.toml)
    /// 3. Config file in home directory (~/.config/sepolicy-analyzer/config.toml)
    /// 4. Default values
    pub fn load() -> AppResult<Self> {
        let mut config = Self::default();

        // Try to load from home directory config
        if let Some(home) = env::var_os("HOME") {
            let home_config = PathBuf::from(home)
                .join(".config")
                .join("sepolicy-analyzer")
                .join("config.toml");

            if home_config.exists() {
                let content = fs::read_to_string(&home_config)
                    .map_err(|e| config_error(format!("Failed to read config file: {}", e)))?;
                config = toml::from_str(&content)
                    .map_err(|e| config_error(format!("Invalid config file: {}", e)))?;
            }
        }

        // Try to load from current directory config (overrides home config)
        let local_config = PathBuf::from(".sepolicy-analyzer.toml");
        if local_config.exists() {
            let content = fs::read_to_string(&local_config)
                .map_err(|e| config_error(format!("Failed to read config file: {}", e)))?;
            config = toml::from_str(&content)
                .map_err(|e| config_error(format!("Invalid config file: {}", e)))?;
        }

        // Override with environment variables
        if let Ok(max_bools) = env::var("SEPOLICY_COND_MAX_BOOLS") {
            config.cond.max_bools = max_bools
                .parse()
                .map_err(|_| config_error("SEPOLICY_COND_MAX_BOOLS must be an integer"))?;
        }

        if let Ok(max_depth) = env::var("SEPOLICY_COND_MAX_DEPTH") {
            config.cond.max_depth = max_depth
                .parse()
                .map_err(|_| config_error("SEPOLICY_COND_MAX_DEPTH must be an integer"))?;
        }

        if let Ok(hash_bits) = env::var("SEPOLICY_INDEX_HASH_BITS") {
            config.index.hash_bits = hash_bits
                .parse()
                .map_err(|_| config_error("SEPOLICY_INDEX_HASH_BITS must be an integer"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate limits
    ///
    /// # Notes
    ///
    /// - `max_bools` is capped at 30: the truth-table sweep stores one result
    ///   per assignment and 2^31 assignments no longer fit an addressable table
    pub fn validate(&self) -> AppResult<()> {
        if self.cond.max_bools == 0 || self.cond.max_bools > 30 {
            return Err(config_error(format!(
                "cond.max_bools must be between 1 and 30, got {}",
                self.cond.max_bools
            )));
        }
        if self.cond.max_depth == 0 {
            return Err(config_error("cond.max_depth must be at least 1"));
        }
        if self.index.hash_bits == 0 || self.index.hash_bits > 24 {
            return Err(config_error(format!(
                "index.hash_bits must be between 1 and 24, got {}",
                self.index.hash_bits
            )));
        }
        Ok(())
    }
}
