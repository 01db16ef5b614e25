use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::client::CompletionClient;
use crate::config::EndpointConfig;
use crate::error::{classify_status, Error, Result};
use crate::failover::RetryPolicy;
use crate::request::{ChatRequest, ChatResponse, CompletionResult, Message};

/// Client for one chat-completions backend.
///
/// Immutable after construction, so one instance can serve any number of
/// concurrent callers without locking.
#[derive(Debug, Clone)]
pub struct EndpointClient
{   config: EndpointConfig
  , retry: RetryPolicy
  , http_client: reqwest::Client
}

impl EndpointClient
{   pub fn new(config: EndpointConfig) -> Result<Self>
    {   debug!(
          "Creating EndpointClient {} for model {} at {}",
          config.name, config.model, config.address
        );
        let http_client = reqwest::Client::builder()
          .timeout(config.timeout())
          .build()
          .map_err(|e| {
            error!("Failed to build HTTP client: {}", e);
            Error::InvalidConfiguration(e.to_string())
          })?;
        Ok(EndpointClient
        {   config
          , retry: RetryPolicy::default()
          , http_client
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self
    {   self.retry = retry;
        self
    }

    pub fn config(&self) -> &EndpointConfig
    {   &self.config
    }

    pub fn name(&self) -> &str
    {   &self.config.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy
    {   &self.retry
    }

    /// POST the conversation and read the whole body back
    async fn exchange(
      &self
    , messages: &[Message]
    ) -> std::result::Result<(reqwest::StatusCode, String), reqwest::Error>
    {   let request = ChatRequest
        {   model: &self.config.model
          , messages
          , temperature: self.config.temperature
          , max_tokens: self.config.max_tokens
        };
        trace!("{} request: {:?}", self.config.name, request);

        let mut builder = self.http_client
          .post(&self.config.address)
          .json(&request);
        if let Some(api_key) = &self.config.api_key
        {   builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        trace!("{} response status: {}", self.config.name, status);
        Ok((status, body))
    }
}

#[async_trait]
impl CompletionClient for EndpointClient
{   async fn complete(
      &self
    , messages: &[Message]
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>
    {   if cancel.is_cancelled()
        {   return Err(Error::Cancelled);
        }

        let (status, body) = tokio::select!
        { biased;
          _ = cancel.cancelled() => {
            debug!("{} request cancelled in flight", self.config.name);
            return Err(Error::Cancelled);
          }
        , exchanged = self.exchange(messages) => {
            exchanged.map_err(|e| {
              error!("{} transport error: {}", self.config.name, e);
              Error::from(e)
            })?
          }
        };

        if !status.is_success()
        {   let err = classify_status(status.as_u16(), &body);
            warn!("{} returned {}", self.config.name, err);
            return Err(err);
        }

        let response: ChatResponse = serde_json::from_str(&body)
          .map_err(|e| {
            error!("{} response did not decode: {}", self.config.name, e);
            Error::Decode(e.to_string())
          })?;
        response.into_result(&self.config.name, &self.config.model)
    }

    async fn complete_with_retry(
      &self
    , messages: &[Message]
    , max_retries: usize
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>
    {   let max_attempts = max_retries.max(1);
        let mut attempt = 0;
        loop
        {   if attempt > 0
            {   let backoff = self.retry.backoff_for_attempt(attempt);
                debug!(
                  "{} backing off {:?} before attempt {}",
                  self.config.name, backoff, attempt + 1
                );
                tokio::select!
                { biased;
                  _ = cancel.cancelled() => {
                    debug!("{} backoff cancelled", self.config.name);
                    return Err(Error::Cancelled);
                  }
                , _ = tokio::time::sleep(backoff) => {}
                }
            }

            let err = match self.complete(messages, cancel).await
            {   Ok(result) => {
                  if attempt > 0
                  {   info!(
                        "{} succeeded on attempt {}",
                        self.config.name, attempt + 1
                      );
                  }
                  return Ok(result);
                }
              , Err(e) => e
            };
            attempt += 1;

            if err.is_cancelled()
            {   return Err(err);
            }
            if !err.is_retryable()
            {   warn!(
                  "{} attempt {} failed with non-retryable error: {}",
                  self.config.name, attempt, err
                );
                return Err(Error::NonRetryable
                {   attempt
                  , source: Box::new(err)
                });
            }
            if attempt >= max_attempts
            {   error!(
                  "{} failed after {} attempts: {}",
                  self.config.name, attempt, err
                );
                return Err(Error::RetriesExhausted
                {   attempts: attempt
                  , source: Box::new(err)
                });
            }
            warn!(
              "{} attempt {}/{} failed: {}",
              self.config.name, attempt, max_attempts, err
            );
        }
    }
}
