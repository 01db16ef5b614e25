//! Configuration for endpoints, circuit breakers, and retry behavior

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Local gateway used when no address is configured
pub const DEFAULT_ADDRESS: &str
  = "http://localhost:4000/v1/chat/completions";

fn default_address() -> String { DEFAULT_ADDRESS.to_string() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 2000 }
fn default_timeout_secs() -> u64 { 60 }

/// One backend target. Immutable once handed to an `EndpointClient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig
{   /// Logical name used in logs and circuit status
    pub name: String
  , /// Full URL requests are POSTed to
    #[serde(default = "default_address")]
    pub address: String
  , /// Model identifier sent with every request
    pub model: String
  , /// Static bearer token
    #[serde(default)]
    pub api_key: Option<String>
  , #[serde(default = "default_temperature")]
    pub temperature: f32
  , #[serde(default = "default_max_tokens")]
    pub max_tokens: u32
  , /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64
}

impl EndpointConfig
{   /// Endpoint on the default local gateway
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self
    {   EndpointConfig
        {   name: name.into()
          , address: default_address()
          , model: model.into()
          , api_key: None
          , temperature: default_temperature()
          , max_tokens: default_max_tokens()
          , timeout_secs: default_timeout_secs()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self
    {   self.address = address.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self
    {   self.api_key = Some(key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self
    {   self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self
    {   self.max_tokens = max_tokens;
        self
    }

    /// Timeouts are kept in whole seconds. A fractional timeout rounds up
    /// to the next second and nothing goes below one second.
    pub fn with_timeout(mut self, timeout: Duration) -> Self
    {   let whole = timeout.as_secs();
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = whole.saturating_add(partial).max(1);
        self
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_secs(self.timeout_secs)
    }

    /// Build from `{PREFIX}_MODEL` and friends.
    ///
    /// `{PREFIX}_MODEL` is required; address, key, temperature, max tokens
    /// and timeout fall back to defaults when unset.
    pub fn from_env(prefix: &str) -> Result<Self>
    {   let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();
        let model = var("MODEL").ok_or_else(|| {
          Error::InvalidConfiguration(format!("{}_MODEL is not set", prefix))
        })?;

        let mut config = EndpointConfig::new(prefix.to_lowercase(), model);
        if let Some(address) = var("ADDRESS")
        {   config.address = address;
        }
        config.api_key = var("API_KEY").filter(|k| !k.is_empty());
        if let Some(raw) = var("TEMPERATURE")
        {   config.temperature = parse_env(prefix, "TEMPERATURE", &raw)?;
        }
        if let Some(raw) = var("MAX_TOKENS")
        {   config.max_tokens = parse_env(prefix, "MAX_TOKENS", &raw)?;
        }
        if let Some(raw) = var("TIMEOUT_SECS")
        {   config.timeout_secs = parse_env(prefix, "TIMEOUT_SECS", &raw)?;
        }
        debug!("Loaded endpoint {} from environment", config.name);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()>
    {   if self.name.trim().is_empty()
        {   return Err(Error::InvalidConfiguration(
              "endpoint name is empty".to_string()
            ));
        }
        if self.model.trim().is_empty()
        {   return Err(Error::InvalidConfiguration(
              format!("endpoint {}: model is empty", self.name)
            ));
        }
        if !(self.address.starts_with("http://")
          || self.address.starts_with("https://"))
        {   return Err(Error::InvalidConfiguration(
              format!(
                "endpoint {}: address {:?} is not an http(s) URL",
                self.name, self.address
              )
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature)
        {   return Err(Error::InvalidConfiguration(
              format!(
                "endpoint {}: temperature {} outside [0, 2]",
                self.name, self.temperature
              )
            ));
        }
        if self.timeout_secs == 0
        {   return Err(Error::InvalidConfiguration(
              format!("endpoint {}: timeout must be non-zero", self.name)
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
  prefix: &str
, suffix: &str
, raw: &str
) -> Result<T>
{   raw.trim().parse().map_err(|_| {
      Error::InvalidConfiguration(
        format!("{}_{}={:?} is not valid", prefix, suffix, raw)
      )
    })
}

/// Thresholds shared by every endpoint's circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig
{   /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32
  , /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32
  , /// Time an open circuit waits before admitting a probe
    pub open_timeout_ms: u64
  , /// Span of the recent-failure window
    pub failure_window_ms: u64
}

impl CircuitBreakerConfig
{   pub fn open_timeout(&self) -> Duration
    {   Duration::from_millis(self.open_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration
    {   Duration::from_millis(self.failure_window_ms)
    }

    pub fn validate(&self) -> Result<()>
    {   if self.failure_threshold == 0 || self.success_threshold == 0
        {   return Err(Error::InvalidConfiguration(
              "circuit breaker thresholds must be at least 1".to_string()
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig
{   fn default() -> Self
    {   CircuitBreakerConfig
        {   failure_threshold: 5
          , success_threshold: 2
          , open_timeout_ms: 60_000
          , failure_window_ms: 5 * 60_000
        }
    }
}

/// Within-endpoint retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig
{   /// Attempts per endpoint in `complete_with_retry`
    pub max_retries: usize
  , /// Backoff after attempt `n` is `n² × backoff_unit_ms`
    pub backoff_unit_ms: u64
  , /// Optional ceiling on a single backoff; uncapped when unset
    pub max_backoff_ms: Option<u64>
}

impl Default for RetryConfig
{   fn default() -> Self
    {   RetryConfig
        {   max_retries: 3
          , backoff_unit_ms: 1000
          , max_backoff_ms: None
        }
    }
}

/// Ordered endpoint list plus shared breaker and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig
{   /// Endpoints in fallback order; the first is the primary
    pub endpoints: Vec<EndpointConfig>
  , #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig
  , #[serde(default)]
    pub retry: RetryConfig
}

impl RouterConfig
{   pub fn new(endpoints: Vec<EndpointConfig>) -> Self
    {   RouterConfig
        {   endpoints
          , circuit_breaker: CircuitBreakerConfig::default()
          , retry: RetryConfig::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self>
    {   let config: RouterConfig = serde_json::from_str(json)
          .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self>
    {   let path = path.as_ref();
        debug!("Loading router config from {}", path.display());
        let json = std::fs::read_to_string(path).map_err(|e| {
          Error::InvalidConfiguration(
            format!("cannot read {}: {}", path.display(), e)
          )
        })?;
        RouterConfig::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()>
    {   if self.endpoints.is_empty()
        {   return Err(Error::InvalidConfiguration(
              "router needs at least one endpoint".to_string()
            ));
        }
        let mut names = HashSet::new();
        for endpoint in &self.endpoints
        {   endpoint.validate()?;
            if !names.insert(endpoint.name.as_str())
            {   return Err(Error::InvalidConfiguration(
                  format!("duplicate endpoint name {}", endpoint.name)
                ));
            }
        }
        self.circuit_breaker.validate()
    }
}
