//! Resilient completion client for chat-style text-generation backends.
//!
//! Requests go to a primary endpoint and fall back through an ordered list
//! of alternates. Each endpoint has its own circuit breaker, and structured
//! (JSON) payloads can be pulled out of free-form responses on demand.
//!
//! ```text
//! caller
//!   → FallbackRouter          (failover.rs)
//!       → CircuitBreaker::is_open   (circuit.rs)
//!       → EndpointClient::complete  (providers/endpoint.rs)
//!           → classify_status on non-2xx (error.rs)
//!       → CircuitBreaker::record_*
//!   → parse_response / extract_json on demand (extract.rs)
//! ```
//!
//! ```no_run
//! use llm_cascade::{CompletionClient, EndpointConfig, FallbackRouter, Message, RouterConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> llm_cascade::Result<()> {
//! let router = FallbackRouter::from_config(RouterConfig::new(vec![
//!   EndpointConfig::new("primary", "gpt-4o-mini"),
//!   EndpointConfig::new("local", "llama3")
//!     .with_address("http://localhost:11434/v1/chat/completions"),
//! ]))?;
//! let cancel = CancellationToken::new();
//! let result = router
//!   .complete_with_retry(&[Message::user("Reply with {\"ok\": true}")], 3, &cancel)
//!   .await?;
//! let payload = router.extract_json(result.text().unwrap_or_default())?;
//! # let _ = payload;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod providers;
pub mod request;
pub mod extract;
pub mod circuit;
pub mod failover;
pub mod client;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus};
pub use client::CompletionClient;
pub use config::{CircuitBreakerConfig, EndpointConfig, RetryConfig, RouterConfig};
pub use error::{Error, ErrorKind, Result};
pub use extract::{extract_json, parse_response, ExtractStrategy};
pub use failover::{FallbackRouter, RetryPolicy};
pub use providers::EndpointClient;
pub use request::{Candidate, CompletionResult, Message, Role, Usage};
