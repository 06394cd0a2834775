use crate::error::RunnerError;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Aggregated metric values keyed by metric name.
pub type Evaluations = BTreeMap<String, f64>;

/// Stateful collector of per-document evaluation signals for one trial.
///
/// Runners never mutate the instance they were configured with: each trial
/// works on the copy returned by `get_fresh_callback`, which must share no
/// state with `self`.
pub trait EvaluationCallback {
    /// Called once per response the flow produces.
    fn on_done(&mut self, response: &Value) -> Result<()>;

    /// A zeroed, independent instance with the same configuration.
    fn get_fresh_callback(&self) -> Box<dyn EvaluationCallback>;

    /// Aggregate over everything seen so far. Must not change state.
    fn get_mean_evaluation(&self) -> Result<Evaluations>;
}

/// Averages `evaluations[].value` over every document of every response.
///
/// Responses look like `{"docs": [{"evaluations": [{"op_name": "recall",
/// "value": 0.5}]}]}`. Documents without evaluations still count toward the
/// denominator.
#[derive(Debug, Clone, Default)]
pub struct MeanEvaluationCallback {
    eval_name: Option<String>,
    sums: BTreeMap<String, f64>,
    n_docs: usize,
}

impl MeanEvaluationCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_metric(eval_name: impl Into<String>) -> Self {
        Self {
            eval_name: Some(eval_name.into()),
            ..Self::default()
        }
    }

    pub fn eval_name(&self) -> Option<&str> {
        self.eval_name.as_deref()
    }

    pub fn n_docs(&self) -> usize {
        self.n_docs
    }
}

impl EvaluationCallback for MeanEvaluationCallback {
    fn on_done(&mut self, response: &Value) -> Result<()> {
        let docs = match response.get("docs").and_then(|v| v.as_array()) {
            Some(docs) => docs,
            None => return Ok(()),
        };
        self.n_docs += docs.len();
        for doc in docs {
            let evaluations = match doc.get("evaluations").and_then(|v| v.as_array()) {
                Some(evaluations) => evaluations,
                None => continue,
            };
            for evaluation in evaluations {
                let op_name = evaluation
                    .get("op_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("evaluation without op_name: {}", evaluation))?;
                let value = evaluation
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| anyhow!("evaluation '{}' has no numeric value", op_name))?;
                *self.sums.entry(op_name.to_string()).or_default() += value;
            }
        }
        Ok(())
    }

    fn get_fresh_callback(&self) -> Box<dyn EvaluationCallback> {
        Box::new(Self {
            eval_name: self.eval_name.clone(),
            ..Self::default()
        })
    }

    fn get_mean_evaluation(&self) -> Result<Evaluations> {
        if self.n_docs == 0 {
            return Err(RunnerError::NoEvaluations.into());
        }
        let n = self.n_docs as f64;
        match &self.eval_name {
            Some(name) => {
                let sum = self.sums.get(name).copied().unwrap_or_default();
                Ok(BTreeMap::from([(name.clone(), sum / n)]))
            }
            None => Ok(self
                .sums
                .iter()
                .map(|(name, sum)| (name.clone(), sum / n))
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(values: &[f64]) -> Value {
        let docs: Vec<Value> = values
            .iter()
            .map(|v| {
                json!({"evaluations": [
                    {"op_name": "recall", "value": v},
                    {"op_name": "precision", "value": v / 2.0}
                ]})
            })
            .collect();
        json!({ "docs": docs })
    }

    #[test]
    fn mean_is_taken_over_all_documents() {
        let mut cb = MeanEvaluationCallback::new();
        cb.on_done(&response(&[1.0, 0.0])).expect("first");
        cb.on_done(&response(&[0.5])).expect("second");
        let evals = cb.get_mean_evaluation().expect("mean");
        assert_eq!(evals["recall"], 0.5);
        assert_eq!(evals["precision"], 0.25);
        assert_eq!(cb.get_mean_evaluation().expect("repeat"), evals);
    }

    #[test]
    fn metric_filter_reports_only_that_metric() {
        let mut cb = MeanEvaluationCallback::for_metric("precision");
        cb.on_done(&response(&[1.0, 1.0])).expect("on_done");
        let evals = cb.get_mean_evaluation().expect("mean");
        assert_eq!(evals.len(), 1);
        assert_eq!(evals["precision"], 0.5);
    }

    #[test]
    fn fresh_callback_starts_from_zero_and_keeps_filter() {
        let mut cb = MeanEvaluationCallback::for_metric("recall");
        cb.on_done(&response(&[1.0])).expect("on_done");
        let mut fresh = cb.get_fresh_callback();
        assert_eq!(
            fresh.get_mean_evaluation().expect_err("fresh has no docs").to_string(),
            RunnerError::NoEvaluations.to_string()
        );
        fresh.on_done(&response(&[0.0])).expect("on_done");
        assert_eq!(fresh.get_mean_evaluation().expect("mean")["recall"], 0.0);
        assert_eq!(cb.get_mean_evaluation().expect("original")["recall"], 1.0);
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let mut cb = MeanEvaluationCallback::new();
        let bad = json!({"docs": [{"evaluations": [{"op_name": "recall", "value": "high"}]}]});
        let err = cb.on_done(&bad).expect_err("string value");
        assert!(err.to_string().contains("recall"), "unexpected: {}", err);
    }
}
