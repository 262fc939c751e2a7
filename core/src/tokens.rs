//! Token Counting and Budgets
//!
//! Provides the tokenizer seam used for all budget math, proportional
//! token-budget allocation, token-aligned truncation, and the suffix-fit
//! scan the memories use to decide their compression boundary.

use std::collections::HashMap;
use std::sync::Arc;

/// Token counting and truncation interface.
///
/// Budgets are only meaningful when this approximates the serving model's
/// actual tokenization; the shipped implementation is a heuristic and a
/// real tokenizer can be injected through this trait.
pub trait Tokenizer: Send + Sync {
    /// Count tokens in text
    fn count(&self, text: &str) -> usize;

    /// Return the longest token-aligned prefix of `text` that fits
    /// `max_tokens`. Must be deterministic, always a valid string, and
    /// idempotent: `truncate(truncate(t, n), n) == truncate(t, n)`.
    /// A non-positive budget yields an empty string.
    fn truncate(&self, text: &str, max_tokens: i64) -> String;
}

/// Character-ratio token estimator.
///
/// Uses a fixed characters-per-token estimate (~4 for English prose).
/// Counts are conservative upper bounds, not exact; this is an
/// approximation and is documented as such on the trait.
pub struct HeuristicTokenizer {
    chars_per_token: usize,
}

impl HeuristicTokenizer {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }

    fn truncate(&self, text: &str, max_tokens: i64) -> String {
        if max_tokens <= 0 {
            return String::new();
        }
        let max_chars = (max_tokens as usize).saturating_mul(self.chars_per_token);
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        text.chars().take(max_chars).collect()
    }
}

/// Create a shared default tokenizer
pub fn default_tokenizer() -> Arc<dyn Tokenizer> {
    Arc::new(HeuristicTokenizer::default())
}

/// Converts named proportional ratios into absolute token budgets.
///
/// Each field's budget is `floor((context_window - template_tokens -
/// reserved) * ratio)`. The remainder can go negative when the rendered
/// template already exceeds the window; budgets are returned as-is and
/// callers treat non-positive values as truncate-to-empty.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    pub context_window: usize,
    pub reserved: usize,
}

impl TokenBudget {
    pub fn new(context_window: usize) -> Self {
        Self {
            context_window,
            reserved: 100,
        }
    }

    pub fn with_reserved(mut self, reserved: usize) -> Self {
        self.reserved = reserved;
        self
    }

    /// Allocate a budget per named field
    pub fn allocate(&self, ratios: &[(&str, f64)], template_tokens: usize) -> HashMap<String, i64> {
        let remain =
            self.context_window as i64 - template_tokens as i64 - self.reserved as i64;
        ratios
            .iter()
            .map(|(name, ratio)| ((*name).to_string(), ((remain as f64) * ratio).floor() as i64))
            .collect()
    }
}

/// Returns the minimal index `i` such that `parts[i..]`, joined with
/// `separator`, fits `max_tokens`.
///
/// Scans from the newest part backward, accumulating token cost including
/// separator overhead, and stops at the last index whose cumulative cost
/// still fits. Returns `parts.len()` when even the newest part alone
/// exceeds the budget (the empty suffix always fits).
pub fn fit_suffix_start(
    parts: &[String],
    separator: &str,
    max_tokens: i64,
    tokenizer: &dyn Tokenizer,
) -> usize {
    let sep_cost = tokenizer.count(separator) as i64;
    let mut cumulative: i64 = 0;
    let mut start = parts.len();

    for i in (0..parts.len()).rev() {
        cumulative += tokenizer.count(&parts[i]) as i64;
        if i + 1 < parts.len() {
            cumulative += sep_cost;
        }
        if cumulative > max_tokens {
            break;
        }
        start = i;
    }

    start
}
