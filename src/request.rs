//! Conversation, wire, and result types for chat completion requests

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Speaker of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , User
  , Assistant
}

/// One turn of a conversation; serialized as `{role, content}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message
{   pub role: Role
  , #[serde(rename = "content")]
    pub text: String
}

impl Message
{   pub fn new(role: Role, text: impl Into<String>) -> Self
    {   Message
        {   role
          , text: text.into()
        }
    }

    pub fn system(text: impl Into<String>) -> Self
    {   Message::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self
    {   Message::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self
    {   Message::new(Role::Assistant, text)
    }
}

// ===== Wire Types =====

/// Request body POSTed to an endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a>
{   pub model: &'a str
  , pub messages: &'a [Message]
  , pub temperature: f32
  , pub max_tokens: u32
}

/// Successful response body
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse
{   pub choices: Vec<Choice>
  , #[serde(default)]
    pub model: Option<String>
  , #[serde(default)]
    pub usage: Option<Usage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: Candidate
}

/// Error body sent alongside non-2xx statuses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorEnvelope
{   pub error: ApiErrorDetail
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetail
{   pub message: String
  , #[serde(rename = "type", default)]
    pub error_type: Option<String>
  , /// Some backends send a string code, others a number
    #[serde(default)]
    pub code: Option<serde_json::Value>
}

// ===== Results =====

/// Output candidate returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate
{   pub role: Role
  , #[serde(rename = "content", default)]
    pub text: String
}

/// Token counters reported by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage
{   #[serde(rename = "prompt_tokens", default)]
    pub input_tokens: u64
  , #[serde(rename = "completion_tokens", default)]
    pub output_tokens: u64
}

/// Result of a completed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResult
{   /// Logical name of the endpoint that answered
    pub backend: String
  , /// Model reported by the backend, or the configured one
    pub model: String
  , pub candidates: Vec<Candidate>
  , pub usage: Usage
}

impl CompletionResult
{   /// Text of the first candidate
    pub fn text(&self) -> Option<&str>
    {   self.candidates.first().map(|c| c.text.as_str())
    }
}

impl ChatResponse
{   /// Convert into a `CompletionResult`, rejecting empty choice lists
    pub fn into_result(
      self
    , backend: &str
    , configured_model: &str
    ) -> Result<CompletionResult>
    {   if self.choices.is_empty()
        {   return Err(Error::NoChoicesInResponse);
        }
        Ok(CompletionResult
        {   backend: backend.to_string()
          , model: self.model
              .unwrap_or_else(|| configured_model.to_string())
          , candidates: self.choices
              .into_iter()
              .map(|c| c.message)
              .collect()
          , usage: self.usage.unwrap_or_default()
        })
    }
}
