//! Static per-model pricing used for cost estimates
//!
//! Rates are USD per million tokens. Lookups try an exact match, then the
//! longest row that prefixes the model name (dated snapshots such as
//! `gpt-4o-2024-08-06`), then the default model's row.

/// Input/output rates for one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub model: &'static str,
    /// USD per million prompt tokens
    pub input: f64,
    /// USD per million completion tokens
    pub output: f64,
}

impl ModelRate {
    pub const fn new(model: &'static str, input: f64, output: f64) -> Self {
        Self {
            model,
            input,
            output,
        }
    }

    /// USD cost for the given token counts
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        f64::from(prompt_tokens) / 1e6 * self.input + f64::from(completion_tokens) / 1e6 * self.output
    }
}

/// A vendor's pricing rows
#[derive(Debug, Clone, Copy)]
pub struct PricingTable {
    rows: &'static [ModelRate],
}

impl PricingTable {
    /// Creates a table; `rows` must not be empty
    pub const fn new(rows: &'static [ModelRate]) -> Self {
        assert!(!rows.is_empty(), "pricing table needs at least one row");
        Self { rows }
    }

    pub fn rows(&self) -> &'static [ModelRate] {
        self.rows
    }

    /// Finds the row for a model without any fallback
    pub fn lookup(&self, model: &str) -> Option<&'static ModelRate> {
        if let Some(row) = self.rows.iter().find(|r| r.model == model) {
            return Some(row);
        }

        self.rows
            .iter()
            .filter(|r| model.starts_with(r.model))
            .max_by_key(|r| r.model.len())
    }

    /// Finds the row for a model, falling back to the default model's row
    ///
    /// If even the default model is missing, the first row is used so the
    /// estimate is never zero.
    pub fn rate_for(&self, model: &str, default_model: &str) -> &'static ModelRate {
        self.lookup(model)
            .or_else(|| self.lookup(default_model))
            .unwrap_or(&self.rows[0])
    }
}

pub static OPENAI_PRICING: PricingTable = PricingTable::new(&[
    ModelRate::new("gpt-4o-mini", 0.15, 0.60),
    ModelRate::new("gpt-4o", 2.50, 10.00),
    ModelRate::new("gpt-4.1-nano", 0.10, 0.40),
    ModelRate::new("gpt-4.1-mini", 0.40, 1.60),
    ModelRate::new("gpt-4.1", 2.00, 8.00),
    ModelRate::new("o3-mini", 1.10, 4.40),
]);

pub static ANTHROPIC_PRICING: PricingTable = PricingTable::new(&[
    ModelRate::new("claude-3-5-haiku", 0.80, 4.00),
    ModelRate::new("claude-3-5-sonnet", 3.00, 15.00),
    ModelRate::new("claude-3-7-sonnet", 3.00, 15.00),
    ModelRate::new("claude-sonnet-4", 3.00, 15.00),
    ModelRate::new("claude-opus-4", 15.00, 75.00),
]);

pub static GEMINI_PRICING: PricingTable = PricingTable::new(&[
    ModelRate::new("gemini-2.0-flash", 0.10, 0.40),
    ModelRate::new("gemini-2.5-flash", 0.30, 2.50),
    ModelRate::new("gemini-2.5-pro", 1.25, 10.00),
    ModelRate::new("gemini-1.5-flash", 0.075, 0.30),
]);
