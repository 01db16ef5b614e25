//! Structured payload extraction from free-form model output
//!
//! Model output is unreliable: well-behaved models wrap JSON in a fenced
//! block, others drop it inline among prose, some emit it bare. Each
//! strategy below proposes a candidate substring and the first candidate
//! that decodes into the caller's target type wins.

use std::fmt;

use log::{debug, trace};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

const FENCE: &str = "```";

/// Extraction strategies, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStrategy
{   /// Content of the first markdown fenced block
    FencedBlock
  , /// First balanced `{...}` or `[...]` region
    BalancedRegion
  , /// Whole text, trimmed
    RawContent
}

impl ExtractStrategy
{   pub const ALL: [ExtractStrategy; 3] = [
      ExtractStrategy::FencedBlock
    , ExtractStrategy::BalancedRegion
    , ExtractStrategy::RawContent
    ];

    /// Candidate substring proposed by this strategy
    pub fn candidate(self, text: &str) -> std::result::Result<&str, String>
    {   match self
        {   ExtractStrategy::FencedBlock => fenced_block(text)
          , ExtractStrategy::BalancedRegion => balanced_region(text)
          , ExtractStrategy::RawContent => Ok(text.trim())
        }
    }
}

impl fmt::Display for ExtractStrategy
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   let name = match self
        {   ExtractStrategy::FencedBlock => "fenced block"
          , ExtractStrategy::BalancedRegion => "balanced region"
          , ExtractStrategy::RawContent => "raw content"
        };
        f.write_str(name)
    }
}

/// Decode the first candidate that parses as `T`.
///
/// Fails with the error of the last strategy tried when none parse.
pub fn parse_response<T: DeserializeOwned>(text: &str) -> Result<T>
{   let mut last_error = String::new();
    for strategy in ExtractStrategy::ALL
    {   let candidate = match strategy.candidate(text)
        {   Ok(candidate) => candidate
          , Err(e) => {
              trace!("{} strategy found nothing: {}", strategy, e);
              last_error = e;
              continue;
            }
        };
        match serde_json::from_str::<T>(candidate)
        {   Ok(value) => {
              debug!("extracted payload via {} strategy", strategy);
              return Ok(value);
            }
          , Err(e) => {
              trace!("{} candidate did not parse: {}", strategy, e);
              last_error = e.to_string();
            }
        }
    }
    Err(Error::Extraction
    {   strategy: ExtractStrategy::RawContent
      , message: last_error
    })
}

/// Extract an untyped JSON payload
pub fn extract_json(text: &str) -> Result<serde_json::Value>
{   parse_response(text)
}

/// Content between the first fence-open and the next fence-close.
///
/// The opening fence may carry a language tag (```json) on its own line.
fn fenced_block(text: &str) -> std::result::Result<&str, String>
{   let open = text.find(FENCE)
      .ok_or_else(|| "no fenced block".to_string())?;
    let after_open = &text[open + FENCE.len()..];

    let body_start = match after_open.find('\n')
    {   Some(newline) if is_language_tag(&after_open[..newline]) => {
          newline + 1
        }
      , _ => 0
    };
    let body = &after_open[body_start..];

    let close = body.find(FENCE)
      .ok_or_else(|| "unterminated fenced block".to_string())?;
    let content = body[..close].trim();

    if content.starts_with('{') || content.starts_with('[')
    {   Ok(content)
    } else
    {   Err("fenced block does not hold an object or array".to_string())
    }
}

fn is_language_tag(line: &str) -> bool
{   line.trim()
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

/// First `{` or `[` up to the bracket that brings its depth back to zero.
///
/// Only the opening bracket's type is counted. Brackets inside JSON string
/// literals are ignored.
fn balanced_region(text: &str) -> std::result::Result<&str, String>
{   let start = text.find(|c: char| c == '{' || c == '[')
      .ok_or_else(|| "no opening bracket".to_string())?;
    let bytes = text.as_bytes();
    let (open, close) = if bytes[start] == b'{'
    {   (b'{', b'}')
    } else
    {   (b'[', b']')
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate()
    {   if in_string
        {   if escaped
            {   escaped = false;
            } else if byte == b'\\'
            {   escaped = true;
            } else if byte == b'"'
            {   in_string = false;
            }
            continue;
        }
        if byte == b'"'
        {   in_string = true;
        } else if byte == open
        {   depth += 1;
        } else if byte == close
        {   depth -= 1;
            if depth == 0
            {   return Ok(&text[start..=start + offset]);
            }
        }
    }
    Err("unbalanced brackets".to_string())
}
