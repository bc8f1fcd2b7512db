//! Recovery of structured JSON from free-form model output
//!
//! Models wrap JSON in prose, fence it in markdown, or leave trailing commas
//! and bare keys behind. [`extract_json`] tries a fixed sequence of
//! strategies, each only if the previous one failed:
//!
//! 1. the whole input
//! 2. the first fenced code block
//! 3. the first balanced `{...}` / `[...]` span that parses
//! 4. a lightly repaired copy of the best-effort span
//!
//! Parsed values are plain owned data (`serde_json::Value` by default), so a
//! key such as `__proto__` is just a map entry and cannot affect anything else.

mod repair;

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use repair::{find_balanced_span, fenced_block, quote_bare_keys, strip_trailing_commas};

/// How many opener positions are tried when looking for a parseable span
const MAX_SPAN_CANDIDATES: usize = 32;

/// Why extraction failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("no JSON found: input is empty")]
    Empty,

    #[error("no recoverable JSON in input: {message}")]
    Unrecoverable { message: String },

    #[error("parsed JSON was rejected by the validator")]
    ValidationFailed,
}

/// The strategy that produced a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    FencedBlock,
    BalancedSpan,
    Repaired,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Direct => "direct",
            Strategy::FencedBlock => "fenced_block",
            Strategy::BalancedSpan => "balanced_span",
            Strategy::Repaired => "repaired",
        };
        f.write_str(name)
    }
}

/// Outcome of an extraction; data only exists on success
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult<T> {
    Success(T),
    Failure(ExtractionError),
}

impl<T> ExtractionResult<T> {
    pub fn success(&self) -> bool {
        matches!(self, ExtractionResult::Success(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            ExtractionResult::Success(data) => Some(data),
            ExtractionResult::Failure(_) => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            ExtractionResult::Success(data) => Some(data),
            ExtractionResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ExtractionError> {
        match self {
            ExtractionResult::Success(_) => None,
            ExtractionResult::Failure(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<T, ExtractionError> {
        match self {
            ExtractionResult::Success(data) => Ok(data),
            ExtractionResult::Failure(err) => Err(err),
        }
    }

    /// Returns the data or the caller's fallback
    pub fn unwrap_or(self, fallback: T) -> T {
        self.into_data().unwrap_or(fallback)
    }
}

/// Extracts JSON from `text` into `T`
pub fn extract_json<T: DeserializeOwned>(text: &str) -> ExtractionResult<T> {
    extract_inner(text, None)
}

/// Extracts JSON from `text` and checks it with `validator`
///
/// A structurally valid parse that the validator rejects is a failure.
pub fn extract_json_with<T, F>(text: &str, validator: F) -> ExtractionResult<T>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    extract_inner(text, Some(&validator))
}

/// Extracts a list, accepting a bare array or an object with one array field
pub fn extract_json_array<T: DeserializeOwned>(text: &str) -> ExtractionResult<Vec<T>> {
    let value = match extract_json::<Value>(text).into_result() {
        Ok(value) => value,
        Err(err) => return ExtractionResult::Failure(err),
    };

    let array = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(map) => {
            let mut arrays = map.into_iter().filter(|(_, v)| v.is_array());
            match (arrays.next(), arrays.next()) {
                (Some((_, array)), None) => array,
                _ => {
                    return ExtractionResult::Failure(ExtractionError::Unrecoverable {
                        message: "expected an array or an object wrapping exactly one array".to_string(),
                    });
                }
            }
        }
        _ => {
            return ExtractionResult::Failure(ExtractionError::Unrecoverable {
                message: "expected an array".to_string(),
            });
        }
    };

    match serde_json::from_value(array) {
        Ok(items) => ExtractionResult::Success(items),
        Err(e) => ExtractionResult::Failure(ExtractionError::Unrecoverable {
            message: e.to_string(),
        }),
    }
}

fn extract_inner<T: DeserializeOwned>(
    text: &str,
    validator: Option<&dyn Fn(&T) -> bool>,
) -> ExtractionResult<T> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ExtractionResult::Failure(ExtractionError::Empty);
    }

    let mut last_error = String::new();

    match attempt(trimmed) {
        Ok(value) => return finish(value, Strategy::Direct, validator),
        Err(e) => last_error = e,
    }

    if let Some(block) = fenced_block(trimmed) {
        match attempt(block.trim()) {
            Ok(value) => return finish(value, Strategy::FencedBlock, validator),
            Err(e) => last_error = e,
        }
    }

    // The fenced block is searched first, then the whole input
    let search_areas = fenced_block(trimmed).into_iter().chain(std::iter::once(trimmed));

    let mut first_span = None;
    let mut first_tail = None;
    for area in search_areas {
        let mut offset = 0;
        for _ in 0..MAX_SPAN_CANDIDATES {
            let Some(start) = area[offset..].find(['{', '[']).map(|i| i + offset) else {
                break;
            };
            match find_balanced_span(&area[start..]) {
                Some(span) => {
                    first_span.get_or_insert(span);
                    match attempt(span) {
                        Ok(value) => return finish(value, Strategy::BalancedSpan, validator),
                        Err(e) => last_error = e,
                    }
                }
                // Never closed; the tail is only kept for repair
                None => {
                    first_tail.get_or_insert(&area[start..]);
                }
            }
            offset = start + 1;
        }
    }

    if let Some(span) = first_span.or(first_tail) {
        let repaired = quote_bare_keys(&strip_trailing_commas(span));
        match attempt(&repaired) {
            Ok(value) => return finish(value, Strategy::Repaired, validator),
            Err(e) => last_error = e,
        }
    }

    debug!(error = %last_error, input_len = text.len(), "JSON extraction failed");
    ExtractionResult::Failure(ExtractionError::Unrecoverable { message: last_error })
}

fn attempt<T: DeserializeOwned>(candidate: &str) -> Result<T, String> {
    serde_json::from_str(candidate).map_err(|e| e.to_string())
}

fn finish<T>(
    value: T,
    strategy: Strategy,
    validator: Option<&dyn Fn(&T) -> bool>,
) -> ExtractionResult<T> {
    if let Some(validate) = validator {
        if !validate(&value) {
            debug!(strategy = %strategy, "Extracted JSON rejected by validator");
            return ExtractionResult::Failure(ExtractionError::ValidationFailed);
        }
    }

    debug!(strategy = %strategy, "Extracted JSON");
    ExtractionResult::Success(value)
}
