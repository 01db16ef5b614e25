//! Error taxonomy and HTTP status classification
//!
//! Every failure the crate can produce is one `Error` value. Retryability
//! is never stored on the error itself; it is derived from the tagged
//! `ErrorKind` through `ErrorKind::is_retryable`, which in turn consults
//! the status tables below.

use log::{trace, warn};
use thiserror::Error as ThisError;

use crate::extract::ExtractStrategy;
use crate::request::ApiErrorEnvelope;

/// Statuses that are worth another attempt (rate limit and transient 5xx)
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Client errors that will be rejected the same way on every attempt
pub const FATAL_STATUSES: &[u16] = &[400, 401, 403, 404];

/// Longest slice of a raw error body kept in an error message
const MAX_BODY_IN_MESSAGE: usize = 512;

pub type Result<T> = std::result::Result<T, Error>;

/// How the status table files a given HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass
{   Retryable
  , Fatal
  , /// Not in either table; treated as fatal
    Unknown
}

/// Look a status up in the classification tables
pub fn status_class(status: u16) -> StatusClass
{   if RETRYABLE_STATUSES.contains(&status)
    {   StatusClass::Retryable
    } else if FATAL_STATUSES.contains(&status)
    {   StatusClass::Fatal
    } else
    {   StatusClass::Unknown
    }
}

pub fn is_retryable_status(status: u16) -> bool
{   status_class(status) == StatusClass::Retryable
}

/// Tag describing which layer an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind
{   /// Connection refused, reset, or timed out
    Transport
  , /// Backend answered with a non-2xx status
    HttpStatus(u16)
  , /// 2xx response whose body could not be decoded
    Decode
  , /// No extraction strategy produced a structured payload
    Extraction
  , /// Caller cancelled the operation
    Cancelled
  , /// Retry budget or endpoint list used up
    Exhausted
  , /// Bad configuration or bad caller input
    Configuration
}

impl ErrorKind
{   /// Whether another attempt at the same request could succeed
    pub fn is_retryable(self) -> bool
    {   match self
        {   ErrorKind::Transport => true
          , ErrorKind::HttpStatus(status) => is_retryable_status(status)
          , ErrorKind::Decode
          | ErrorKind::Extraction
          | ErrorKind::Cancelled
          | ErrorKind::Exhausted
          | ErrorKind::Configuration => false
        }
    }
}

/// Errors returned by endpoint clients and the fallback router
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error
{   #[error("transport error{}: {message}", timeout_suffix(.timeout))]
    Transport
    {   message: String
      , timeout: bool
    }
  , #[error("HTTP {status}: {message}")]
    HttpStatus
    {   status: u16
      , message: String
      , error_type: Option<String>
    }
  , #[error("failed to decode response: {0}")]
    Decode(String)
  , #[error("API response contained no choices")]
    NoChoicesInResponse
  , #[error("no structured payload found (last strategy: {strategy}): {message}")]
    Extraction
    {   strategy: ExtractStrategy
      , message: String
    }
  , #[error("request cancelled")]
    Cancelled
  , #[error("non-retryable failure on attempt {attempt}: {source}")]
    NonRetryable
    {   attempt: usize
      , #[source]
        source: Box<Error>
    }
  , #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted
    {   attempts: usize
      , #[source]
        source: Box<Error>
    }
  , #[error(
      "all endpoints failed ({attempted} attempted, {skipped} skipped){}",
      last_error_suffix(.last)
    )]
    AllEndpointsFailed
    {   attempted: usize
      , skipped: usize
      , #[source]
        last: Option<Box<Error>>
    }
  , #[error("invalid configuration: {0}")]
    InvalidConfiguration(String)
  , #[error("no circuit at index {index} (router has {len} endpoints)")]
    CircuitNotFound
    {   index: usize
      , len: usize
    }
}

fn timeout_suffix(timeout: &bool) -> &'static str
{   if *timeout { " (timeout)" } else { "" }
}

fn last_error_suffix(last: &Option<Box<Error>>) -> String
{   last.as_ref()
      .map(|e| format!("; last error: {}", e))
      .unwrap_or_default()
}

impl Error
{   /// Tag for this error; wrappers report the tag of what they wrap
    /// unless the wrapper itself is the terminal condition.
    pub fn kind(&self) -> ErrorKind
    {   match self
        {   Error::Transport { .. } => ErrorKind::Transport
          , Error::HttpStatus { status, .. } => ErrorKind::HttpStatus(*status)
          , Error::Decode(_) | Error::NoChoicesInResponse => ErrorKind::Decode
          , Error::Extraction { .. } => ErrorKind::Extraction
          , Error::Cancelled => ErrorKind::Cancelled
          , Error::NonRetryable { source, .. } => source.kind()
          , Error::RetriesExhausted { .. }
          | Error::AllEndpointsFailed { .. } => ErrorKind::Exhausted
          , Error::InvalidConfiguration(_)
          | Error::CircuitNotFound { .. } => ErrorKind::Configuration
        }
    }

    pub fn is_retryable(&self) -> bool
    {   self.kind().is_retryable()
    }

    pub fn is_cancelled(&self) -> bool
    {   self.last_cause() == &Error::Cancelled
    }

    /// Innermost error under any retry or fallback wrappers
    pub fn last_cause(&self) -> &Error
    {   match self
        {   Error::NonRetryable { source, .. }
          | Error::RetriesExhausted { source, .. } => source.last_cause()
          , Error::AllEndpointsFailed { last: Some(last), .. } => {
              last.last_cause()
            }
          , other => other
        }
    }

    /// HTTP status of the innermost error, if it was an HTTP failure
    pub fn status(&self) -> Option<u16>
    {   match self.last_cause()
        {   Error::HttpStatus { status, .. } => Some(*status)
          , _ => None
        }
    }
}

/// Turn a non-2xx status and its body into a classified error.
///
/// Bodies shaped `{"error": {"message", "type", "code"}}` contribute their
/// message and type; anything else is kept as (truncated) raw text.
pub fn classify_status(status: u16, body: &str) -> Error
{   let (message, error_type)
      = match serde_json::from_str::<ApiErrorEnvelope>(body)
      {   Ok(envelope) => (
            envelope.error.message
          , envelope.error.error_type
          )
        , Err(_) => (raw_body_message(status, body), None)
      };

    match status_class(status)
    {   StatusClass::Retryable => {
          trace!("status {} classified retryable", status);
        }
      , StatusClass::Fatal => {
          trace!("status {} classified fatal", status);
        }
      , StatusClass::Unknown => {
          warn!("unrecognized status {}, treating as non-retryable", status);
        }
    }

    Error::HttpStatus
    {   status
      , message
      , error_type
    }
}

fn raw_body_message(status: u16, body: &str) -> String
{   let trimmed = body.trim();
    if trimmed.is_empty()
    {   return reqwest::StatusCode::from_u16(status)
          .ok()
          .and_then(|s| s.canonical_reason())
          .unwrap_or("unknown status")
          .to_string();
    }
    match trimmed.char_indices().nth(MAX_BODY_IN_MESSAGE)
    {   Some((cut, _)) => format!("{}...", &trimmed[..cut])
      , None => trimmed.to_string()
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   Error::Transport
        {   timeout: e.is_timeout()
          , message: e.to_string()
        }
    }
}
