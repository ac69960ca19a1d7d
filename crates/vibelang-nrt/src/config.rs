//! Session options.
//!
//! Options are plain TOML, every field optional:
//!
//! ```toml
//! input_bus_channel_count = 2
//! output_bus_channel_count = 2
//! padding = 1.5
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, SessionError};

/// Options shaping how a session allocates ids and synthesizes its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Hardware input channels. Private audio buses start after inputs and outputs.
    pub input_bus_channel_count: u32,
    /// Hardware output channels.
    pub output_bus_channel_count: u32,
    /// Extra seconds appended to the score's duration.
    pub padding: Option<f64>,
    /// First node id handed out by the session.
    pub node_id_base: i32,
    /// Minimum iteration bound for transition rebuilding.
    pub transition_iteration_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            input_bus_channel_count: 8,
            output_bus_channel_count: 8,
            padding: None,
            node_id_base: 1000,
            transition_iteration_limit: 100,
        }
    }
}

impl SessionOptions {
    /// Parse options from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: SessionOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SessionError::Config(format!(
                "Options file not found at {:?}",
                path
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save options to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// First bus index available for private audio buses.
    pub fn first_private_audio_bus(&self) -> i32 {
        (self.input_bus_channel_count + self.output_bus_channel_count) as i32
    }

    fn validate(&self) -> Result<()> {
        if let Some(padding) = self.padding {
            if !padding.is_finite() || padding < 0.0 {
                return Err(SessionError::Config(format!(
                    "padding must be a non-negative number of seconds, got {}",
                    padding
                )));
            }
        }
        if self.node_id_base < 1 {
            return Err(SessionError::Config(format!(
                "node_id_base must be positive, got {}",
                self.node_id_base
            )));
        }
        if self.transition_iteration_limit == 0 {
            return Err(SessionError::Config(
                "transition_iteration_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
