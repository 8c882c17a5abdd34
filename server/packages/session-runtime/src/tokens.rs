//! Heuristic token counting for conversation accounting.
//!
//! Approximates BPE tokenizers closely enough for budgeting summaries; it is
//! not used for billing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const MESSAGE_OVERHEAD: f64 = 4.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let chars: Vec<char> = text.chars().collect();
        let mut count = 0.0_f64;
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if is_cjk(c) {
                count += 2.0;
                i += 1;
            } else if c.is_alphabetic() {
                let start = i;
                while i < chars.len() && chars[i].is_alphabetic() && !is_cjk(chars[i]) {
                    i += 1;
                }
                count += ((i - start) as f64 * 0.75).max(1.0);
            } else if c.is_numeric() {
                let start = i;
                while i < chars.len() && chars[i].is_numeric() {
                    i += 1;
                }
                count += ((i - start) as f64 * 0.5).max(1.0);
            } else if c.is_whitespace() {
                if i > 0 && !chars[i - 1].is_whitespace() {
                    count += 0.1;
                }
                i += 1;
            } else if c.is_ascii_punctuation() || is_symbol_or_punct(c) {
                count += 0.5;
                i += 1;
            } else {
                count += 1.0;
                i += 1;
            }
        }

        (count + MESSAGE_OVERHEAD).ceil() as usize
    }

    pub fn estimate_all<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> usize {
        texts.into_iter().map(|text| self.estimate(text)).sum()
    }
}

/// Running token accounting for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens across every recorded exchange.
    pub total_tokens: u64,
    pub exchanges: u64,
    /// Tokens of the summaries produced so far.
    pub summary_tokens: u64,
    /// Folded round tokens minus the summary tokens that replaced them.
    /// Negative when a summary came out longer than its rounds.
    pub saved_tokens: i64,
    pub summarized_rounds: u64,
    #[schemars(with = "String")]
    #[schema(value_type = String, format = DateTime)]
    pub last_updated: DateTime<Utc>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self {
            total_tokens: 0,
            exchanges: 0,
            summary_tokens: 0,
            saved_tokens: 0,
            summarized_rounds: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn record_exchange(&mut self, token_count: usize) {
        self.total_tokens = self.total_tokens.saturating_add(token_count as u64);
        self.exchanges += 1;
        self.last_updated = Utc::now();
    }

    pub fn record_summary(&mut self, rounds: usize, folded_tokens: usize, summary_tokens: usize) {
        self.summary_tokens = self.summary_tokens.saturating_add(summary_tokens as u64);
        self.saved_tokens = self
            .saved_tokens
            .saturating_add(folded_tokens as i64 - summary_tokens as i64);
        self.summarized_rounds += rounds as u64;
        self.last_updated = Utc::now();
    }
}

impl Default for TokenUsage {
    fn default() -> Self {
        Self::new()
    }
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x3040..=0x309F
            | 0x30A0..=0x30FF
            | 0xAC00..=0xD7AF
    )
}

// Non-ASCII punctuation and symbols: general punctuation, currency,
// arrows, math operators and CJK/full-width punctuation blocks.
fn is_symbol_or_punct(c: char) -> bool {
    matches!(
        c as u32,
        0x00A1..=0x00BF
            | 0x2000..=0x206F
            | 0x20A0..=0x20CF
            | 0x2190..=0x22FF
            | 0x3000..=0x303F
            | 0xFF01..=0xFF0F
            | 0xFF1A..=0xFF20
    )
}
