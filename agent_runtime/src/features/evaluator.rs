//! Reduces a strategy's output over an evaluation dataset to performance metrics.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use super::loader::{content_hash, FeatureUnit};
use crate::error::{panic_message, RuntimeError};

/// Aggregate metrics over one strategy output sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub profitability: f64,
    pub success_rate: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordShapeError {
    #[error("record {index} is not an object")]
    NotAnObject { index: usize },

    #[error("record {index} has a non-numeric `profit`")]
    NonNumericProfit { index: usize },
}

/// Sum of profits, share of profitable records, and the lowest point the
/// running total reaches. A missing or null `profit` counts as 0.
pub fn assess_performance(results: &[Value]) -> Result<PerformanceSummary, RecordShapeError> {
    if results.is_empty() {
        return Ok(PerformanceSummary::default());
    }

    let mut total = 0.0;
    let mut wins = 0usize;
    let mut drawdown = f64::INFINITY;

    for (index, record) in results.iter().enumerate() {
        let fields = record
            .as_object()
            .ok_or(RecordShapeError::NotAnObject { index })?;
        let profit = match fields.get("profit") {
            None | Some(Value::Null) => 0.0,
            Some(value) => value
                .as_f64()
                .ok_or(RecordShapeError::NonNumericProfit { index })?,
        };

        total += profit;
        if profit > 0.0 {
            wins += 1;
        }
        drawdown = drawdown.min(total);
    }

    Ok(PerformanceSummary {
        profitability: total,
        success_rate: wins as f64 / results.len() as f64,
        max_drawdown: drawdown,
    })
}

/// One evaluation of one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub feature: String,
    #[serde(flatten)]
    pub summary: PerformanceSummary,
    pub records: usize,
    pub execution_time: Duration,
    /// sha256 of the serialized output, stable across identical reruns.
    pub content_hash: String,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceEvaluator;

impl PerformanceEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Invoke `unit` on `data` and summarize the output. Faults inside the
    /// strategy, including panics, come back as errors and are logged here.
    pub fn evaluate(&self, unit: &dyn FeatureUnit, data: &[Value]) -> Result<PerformanceRecord, RuntimeError> {
        let result = self.evaluate_inner(unit, data);
        if let Err(e) = &result {
            error!(feature = %unit.name(), records = data.len(), error = %e, "evaluation failed");
        }
        result
    }

    fn evaluate_inner(&self, unit: &dyn FeatureUnit, data: &[Value]) -> Result<PerformanceRecord, RuntimeError> {
        let name = unit.name().to_string();
        if !unit.has_entry_point() {
            return Err(RuntimeError::ContractViolation {
                name,
                reason: "missing `new_strategy(data)` entry point".to_string(),
            });
        }

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.new_strategy(data)));
        let execution_time = started.elapsed();

        let output = match outcome {
            Ok(result) => result?,
            Err(payload) => {
                return Err(RuntimeError::EvaluationFailure {
                    name,
                    reason: format!("strategy panicked: {}", panic_message(payload.as_ref())),
                })
            }
        };

        let Value::Array(results) = &output else {
            return Err(RuntimeError::ContractViolation {
                name,
                reason: "expected a sequence of records".to_string(),
            });
        };

        let summary = assess_performance(results).map_err(|e| RuntimeError::ContractViolation {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        let serialized = serde_json::to_string(&output).map_err(|e| RuntimeError::ContractViolation {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        debug!(
            feature = %name,
            profitability = summary.profitability,
            success_rate = summary.success_rate,
            max_drawdown = summary.max_drawdown,
            elapsed_ms = execution_time.as_millis() as u64,
            "feature evaluated"
        );

        Ok(PerformanceRecord {
            feature: name,
            summary,
            records: results.len(),
            execution_time,
            content_hash: content_hash(serialized.as_bytes()),
            evaluated_at: Utc::now(),
        })
    }
}
