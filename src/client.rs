//! Uniform completion interface shared by single endpoints and the router
//!
//! Collaborators (prompt builders, decision stores, notifiers) depend on
//! `CompletionClient`, never on the concrete client type, so a single
//! `EndpointClient` and a `FallbackRouter` are interchangeable.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::extract;
use crate::request::{CompletionResult, Message};

#[async_trait]
pub trait CompletionClient: Send + Sync
{   /// One request/response exchange
    async fn complete(
      &self
    , messages: &[Message]
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>;

    /// Like `complete`, retrying transient failures up to `max_retries`
    /// attempts per endpoint
    async fn complete_with_retry(
      &self
    , messages: &[Message]
    , max_retries: usize
    , cancel: &CancellationToken
    ) -> Result<CompletionResult>;

    /// Send a system + user conversation and return the first candidate's
    /// text
    async fn complete_with_system(
      &self
    , system: &str
    , user: &str
    , cancel: &CancellationToken
    ) -> Result<String>
    {   let messages = [Message::system(system), Message::user(user)];
        let result = self.complete(&messages, cancel).await?;
        result.text()
          .map(str::to_string)
          .ok_or(Error::NoChoicesInResponse)
    }

    /// Untyped structured payload embedded in `text`
    fn extract_json(&self, text: &str) -> Result<serde_json::Value>
    {   extract::extract_json(text)
    }

    /// Decode the structured payload embedded in `text` into `T`
    fn parse_response<T: DeserializeOwned>(&self, text: &str) -> Result<T>
    where
      Self: Sized
    {   extract::parse_response(text)
    }
}
