//! Retry policy and the fallback router
//!
//! The router owns its endpoints and their breakers as two parallel
//! vectors indexed by position. Each breaker carries its own lock, so
//! traffic to one endpoint never waits on another endpoint's health
//! bookkeeping. The endpoint list itself never changes after construction.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::circuit::{CircuitBreaker, CircuitStatus};
use crate::client::CompletionClient;
use crate::config::{CircuitBreakerConfig, RetryConfig, RouterConfig};
use crate::error::{Error, Result};
use crate::extract;
use crate::providers::EndpointClient;
use crate::request::{CompletionResult, Message};

/// Backoff schedule for within-endpoint retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy
{   /// Base unit; the wait before attempt `n` is `n² × backoff_unit`
    pub backoff_unit: Duration
  , /// Optional ceiling on a single wait
    pub max_backoff: Option<Duration>
}

impl RetryPolicy
{   /// Create a new retry policy
    pub fn new(backoff_unit: Duration) -> Self
    {   RetryPolicy
        {   backoff_unit
          , max_backoff: None
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self
    {   self.max_backoff = Some(max_backoff);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self
    {   RetryPolicy
        {   backoff_unit: Duration::from_millis(config.backoff_unit_ms)
          , max_backoff: config.max_backoff_ms.map(Duration::from_millis)
        }
    }

    /// Wait before zero-based attempt number `attempt`
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration
    {   let n = u32::try_from(attempt).unwrap_or(u32::MAX);
        let backoff = self.backoff_unit.saturating_mul(n.saturating_mul(n));
        match self.max_backoff
        {   Some(max) => backoff.min(max)
          , None => backoff
        }
    }
}

impl Default for RetryPolicy
{   fn default() -> Self
    {   RetryPolicy::new(Duration::from_secs(1))
    }
}

/// How each endpoint is tried during a cascade
#[derive(Debug, Clone, Copy)]
enum Attempt
{   Once
  , WithRetry(usize)
}

/// Ordered endpoint cascade with one circuit breaker per endpoint
#[derive(Debug)]
pub struct FallbackRouter<C = EndpointClient>
{   endpoints: Vec<C>
  , breakers: Vec<CircuitBreaker>
}

impl<C: CompletionClient> FallbackRouter<C>
{   /// Build a router from `(name, client)` pairs in fallback order
    pub fn new(
      endpoints: Vec<(String, C)>
    , breaker_config: CircuitBreakerConfig
    ) -> Result<Self>
    {   if endpoints.is_empty()
        {   return Err(Error::InvalidConfiguration(
              "router needs at least one endpoint".to_string()
            ));
        }
        breaker_config.validate()?;
        debug!(
          "Creating fallback router with {} endpoints",
          endpoints.len()
        );

        let mut clients = Vec::with_capacity(endpoints.len());
        let mut breakers = Vec::with_capacity(endpoints.len());
        for (index, (name, client)) in endpoints.into_iter().enumerate()
        {   breakers.push(CircuitBreaker::new(index, name, breaker_config));
            clients.push(client);
        }
        Ok(FallbackRouter
        {   endpoints: clients
          , breakers
        })
    }

    pub fn len(&self) -> usize
    {   self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool
    {   self.endpoints.is_empty()
    }

    pub fn endpoint_names(&self) -> Vec<&str>
    {   self.breakers.iter().map(CircuitBreaker::name).collect()
    }

    pub fn endpoint(&self, index: usize) -> Option<&C>
    {   self.endpoints.get(index)
    }

    pub fn circuit(&self, index: usize) -> Option<&CircuitBreaker>
    {   self.breakers.get(index)
    }

    /// Snapshot of every breaker, in endpoint order
    pub fn get_circuit_status(&self) -> Vec<CircuitStatus>
    {   self.breakers.iter().map(CircuitBreaker::status).collect()
    }

    /// Manually close the breaker at `index`
    pub fn reset_circuit(&self, index: usize) -> Result<()>
    {   let breaker = self.breakers.get(index).ok_or(Error::CircuitNotFound
        {   index
          , len: self.breakers.len()
        })?;
        breaker.reset();
        Ok(())
    }

    async fn cascade(
      &self
    , messages: &[Message]
    , attempt: Attempt
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>
    {   let mut attempted = 0;
        let mut skipped = 0;
        let mut last_error: Option<Box<Error>> = None;

        for (index, (client, breaker)) in self.endpoints
          .iter()
          .zip(&self.breakers)
          .enumerate()
        {   if cancel.is_cancelled()
            {   return Err(Error::Cancelled);
            }
            if breaker.is_open()
            {   warn!("Skipping {}: circuit open", breaker.name());
                skipped += 1;
                continue;
            }

            attempted += 1;
            let outcome = match attempt
            {   Attempt::Once => client.complete(messages, cancel).await
              , Attempt::WithRetry(max_retries) => {
                  client
                    .complete_with_retry(messages, max_retries, cancel)
                    .await
                }
            };

            match outcome
            {   Ok(result) => {
                  breaker.record_success();
                  if index > 0
                  {   info!("Request served by fallback {}", breaker.name());
                  }
                  return Ok(result);
                }
              , Err(e) if e.is_cancelled() => {
                  debug!("Cascade cancelled at {}", breaker.name());
                  breaker.release_probe();
                  return Err(e);
                }
              , Err(e) => {
                  breaker.record_failure();
                  if e.is_retryable()
                  {   warn!("{} failed, trying next endpoint: {}", breaker.name(), e);
                  } else
                  {   warn!(
                        "{} rejected request (non-retryable), trying next endpoint: {}",
                        breaker.name(), e
                      );
                  }
                  last_error = Some(Box::new(e));
                }
            }
        }

        error!(
          "All endpoints failed: {} attempted, {} skipped",
          attempted, skipped
        );
        Err(Error::AllEndpointsFailed
        {   attempted
          , skipped
          , last: last_error
        })
    }
}

impl FallbackRouter<EndpointClient>
{   /// Build HTTP endpoint clients and breakers from configuration
    pub fn from_config(config: RouterConfig) -> Result<Self>
    {   config.validate()?;
        let retry = RetryPolicy::from_config(&config.retry);
        let endpoints = config.endpoints
          .into_iter()
          .map(|endpoint| {
            let name = endpoint.name.clone();
            EndpointClient::new(endpoint)
              .map(|client| (name, client.with_retry_policy(retry)))
          })
          .collect::<Result<Vec<_>>>()?;
        FallbackRouter::new(endpoints, config.circuit_breaker)
    }
}

#[async_trait]
impl<C: CompletionClient> CompletionClient for FallbackRouter<C>
{   async fn complete(
      &self
    , messages: &[Message]
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>
    {   self.cascade(messages, Attempt::Once, cancel).await
    }

    async fn complete_with_retry(
      &self
    , messages: &[Message]
    , max_retries: usize
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>
    {   self.cascade(messages, Attempt::WithRetry(max_retries), cancel).await
    }

    /// Extraction does not depend on which endpoint produced the text, so
    /// the primary endpoint's logic is used
    fn extract_json(&self, text: &str) -> Result<serde_json::Value>
    {   match self.endpoints.first()
        {   Some(primary) => primary.extract_json(text)
          , None => extract::extract_json(text)
        }
    }

    fn parse_response<T: DeserializeOwned>(&self, text: &str) -> Result<T>
    where
      Self: Sized
    {   match self.endpoints.first()
        {   Some(primary) => primary.parse_response(text)
          , None => extract::parse_response(text)
        }
    }
}
