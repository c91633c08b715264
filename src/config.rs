//! Configuration for a stream processor

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_ERROR_RESET_MS: u64 = 500;

fn default_timeout_ms() -> u64 { DEFAULT_TIMEOUT_MS }
fn default_error_reset_ms() -> u64 { DEFAULT_ERROR_RESET_MS }

/// Stream processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig
{   /// Chat completions endpoint
    pub url: String
  , /// Extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>
  , /// Window from `send` to the first fragment, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64
  , /// Delay before an errored processor returns to idle
    #[serde(default = "default_error_reset_ms")]
    pub error_reset_ms: u64
  , /// Sent as a bearer token when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>
  , /// Malformed fragments tolerated per cycle (unbounded if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_malformed_fragments: Option<usize>
}

impl Default for ProcessorConfig
{   fn default() -> Self
    {   ProcessorConfig
        {   url: String::new()
          , headers: HashMap::new()
          , timeout_ms: DEFAULT_TIMEOUT_MS
          , error_reset_ms: DEFAULT_ERROR_RESET_MS
          , api_key: None
          , max_malformed_fragments: None
        }
    }
}

impl ProcessorConfig
{   /// Create a configuration targeting `url` with default timings
    pub fn new(url: impl Into<String>) -> Self
    {   ProcessorConfig
        {   url: url.into()
          , ..Default::default()
        }
    }

    pub fn with_header(
      mut self
    , name: impl Into<String>
    , value: impl Into<String>
    ) -> Self
    {   self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self
    {   self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_error_reset_ms(mut self, error_reset_ms: u64) -> Self
    {   self.error_reset_ms = error_reset_ms;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self
    {   self.api_key = Some(key.into());
        self
    }

    pub fn with_max_malformed_fragments(mut self, max: usize) -> Self
    {   self.max_malformed_fragments = Some(max);
        self
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_millis(self.timeout_ms)
    }

    pub fn error_reset_delay(&self) -> Duration
    {   Duration::from_millis(self.error_reset_ms)
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> crate::error::Result<Self>
    {   let config: ProcessorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(
      path: impl AsRef<Path>
    ) -> crate::error::Result<Self>
    {   let path = path.as_ref();
        debug!("Loading processor config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> crate::error::Result<()>
    {   if self.url.trim().is_empty()
        {   return Err(crate::error::Error::InvalidConfiguration(
              "url must not be empty".to_string()
            ));
        }
        if !(self.url.starts_with("http://")
          || self.url.starts_with("https://"))
        {   return Err(crate::error::Error::InvalidConfiguration(
              format!("url must be http(s): {}", self.url)
            ));
        }
        if self.timeout_ms == 0
        {   return Err(crate::error::Error::InvalidConfiguration(
              "timeout_ms must be greater than zero".to_string()
            ));
        }
        Ok(())
    }
}
