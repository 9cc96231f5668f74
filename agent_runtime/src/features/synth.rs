//! Improvement policy and synthesis of corrected strategy code.

use serde::{Deserialize, Serialize};

use super::evaluator::PerformanceSummary;
use crate::error::RuntimeError;

/// Thresholds deciding when a feature needs improvement, and the corrections
/// applied to the synthesized replacement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImprovementPolicy {
    pub min_profitability: f64,
    pub min_success_rate: f64,
    pub min_max_drawdown: f64,
    /// Profit multiplier (> 1) used when profitability was negative.
    pub profit_correction: f64,
    /// Profit multiplier (0..1) used when drawdown fell below `risk_drawdown_trigger`.
    pub risk_correction: f64,
    pub risk_drawdown_trigger: f64,
}

impl Default for ImprovementPolicy {
    fn default() -> Self {
        Self {
            min_profitability: 0.0,
            min_success_rate: 0.6,
            min_max_drawdown: -1000.0,
            profit_correction: 1.1,
            risk_correction: 0.9,
            risk_drawdown_trigger: -500.0,
        }
    }
}

impl ImprovementPolicy {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !self.profit_correction.is_finite() || self.profit_correction <= 1.0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "profit_correction must be greater than 1, got {}",
                self.profit_correction
            )));
        }
        if self.risk_correction.is_nan() || self.risk_correction <= 0.0 || self.risk_correction >= 1.0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "risk_correction must be between 0 and 1, got {}",
                self.risk_correction
            )));
        }
        Ok(())
    }

    /// True if any threshold is violated in the unfavorable direction.
    pub fn needs_improvement(&self, summary: &PerformanceSummary) -> bool {
        summary.profitability < self.min_profitability
            || summary.success_rate < self.min_success_rate
            || summary.max_drawdown < self.min_max_drawdown
    }

    /// `(profit_factor, risk_factor)` for a given previous performance.
    pub fn correction_factors(&self, summary: &PerformanceSummary) -> (f64, f64) {
        let profit = if summary.profitability < 0.0 {
            self.profit_correction
        } else {
            1.0
        };
        let risk = if summary.max_drawdown < self.risk_drawdown_trigger {
            self.risk_correction
        } else {
            1.0
        };
        (profit, risk)
    }
}

/// Multipliers applied to winning and losing records of the improved version.
///
/// Gains are scaled up by the profit factor; losses are divided by it and damped
/// by the risk factor. Neither multiplier moves a record in the unfavorable
/// direction, so the result never trails the records' own expected returns.
pub fn record_multipliers(previous: &PerformanceSummary, policy: &ImprovementPolicy) -> (f64, f64) {
    let (profit_factor, risk_factor) = policy.correction_factors(previous);
    (profit_factor, risk_factor / profit_factor)
}

/// Script body for the improved version of `base`. Pure in its inputs.
///
/// Each input record yields `expected_return * gain` when positive and
/// `expected_return * loss` otherwise (see [`record_multipliers`]); records
/// without a numeric `expected_return` contribute 0.
pub fn synthesize(base: &str, previous: &PerformanceSummary, policy: &ImprovementPolicy) -> String {
    let (gain, loss) = record_multipliers(previous, policy);
    format!(
        r#"// improved version of {base}
// previous: profitability={p:?} success_rate={s:?} max_drawdown={d:?}

fn new_strategy(data) {{
    let results = [];
    for trade in data {{
        let base = 0.0;
        if type_of(trade) == "map" && "expected_return" in trade {{
            base = trade.expected_return;
        }}
        if type_of(base) != "f64" {{
            base = 0.0;
        }}
        let profit = if base > 0.0 {{ base * {gain:?} }} else {{ base * {loss:?} }};
        results.push(#{{ profit: profit, expected_return: base }});
    }}
    results
}}
"#,
        base = base,
        p = previous.profitability,
        s = previous.success_rate,
        d = previous.max_drawdown,
        gain = gain,
        loss = loss,
    )
}
