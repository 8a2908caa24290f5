//! Cost derivation
//!
//! Storage is charged on used bytes at a flat rate per terabyte (10^12 bytes). Costs
//! are rendered with two decimals, thousands separators and the currency symbol in
//! front, e.g. `CHF 1,234.50`.

use serde::Serialize;

const BYTES_PER_TB: f64 = 1e12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostModel {
    per_byte: f64,
    currency: String,
}

impl CostModel {
    pub fn new(cost_per_tb: f64, currency: impl Into<String>) -> Self {
        Self {
            per_byte: cost_per_tb / BYTES_PER_TB,
            currency: currency.into(),
        }
    }

    pub fn cost(&self, used_bytes: i64) -> f64 {
        used_bytes as f64 * self.per_byte
    }

    pub fn format(&self, used_bytes: i64) -> String {
        format_money(self.cost(used_bytes), &self.currency)
    }
}

/// `<symbol> <amount>` with two decimals and comma-grouped thousands.
pub fn format_money(amount: f64, symbol: &str) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if amount < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{} {}{}.{}", symbol, sign, grouped, fraction)
}
