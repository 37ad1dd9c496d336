use anyhow::{bail, Result};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;

/// What a task emits for one document under one metric name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricSample {
    Scalar(f64),
    /// Prediction and gold label, aggregated jointly (F1, correlation).
    Pair { pred: Value, gold: Value },
    /// Diagnostic value with no aggregation.
    Info(Value),
}

impl MetricSample {
    pub fn pair(pred: impl Into<Value>, gold: impl Into<Value>) -> Self {
        MetricSample::Pair {
            pred: pred.into(),
            gold: gold.into(),
        }
    }
}

impl From<f64> for MetricSample {
    fn from(value: f64) -> Self {
        MetricSample::Scalar(value)
    }
}

impl From<bool> for MetricSample {
    fn from(value: bool) -> Self {
        MetricSample::Scalar(if value { 1.0 } else { 0.0 })
    }
}

/// Per-document metric values, in the order the task emitted them.
pub type Metrics = IndexMap<String, MetricSample>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Mean,
    Sum,
    Median,
    /// Macro-averaged F1 over the gold label set, scaled to 0-100.
    MacroF1,
    /// Support-weighted F1 over the gold label set, scaled to 0-100.
    WeightedF1,
    Pearson,
}

impl Aggregation {
    /// Pair-based aggregations are bootstrapped with fewer iterations.
    pub const fn is_expensive(&self) -> bool {
        matches!(
            self,
            Aggregation::MacroF1 | Aggregation::WeightedF1 | Aggregation::Pearson
        )
    }

    pub fn apply(&self, samples: &[&MetricSample]) -> Result<f64> {
        Ok(match self {
            Aggregation::Mean => mean(&scalars(samples)?),
            Aggregation::Sum => scalars(samples)?.iter().sum(),
            Aggregation::Median => median(scalars(samples)?),
            Aggregation::MacroF1 => {
                let (preds, golds) = pairs(samples)?;
                macro_f1(&preds, &golds) * 100.0
            }
            Aggregation::WeightedF1 => {
                let (preds, golds) = pairs(samples)?;
                weighted_f1(&preds, &golds) * 100.0
            }
            Aggregation::Pearson => {
                let (preds, golds) = pairs(samples)?;
                pearson(&numbers(&preds)?, &numbers(&golds)?)
            }
        })
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Aggregation::Mean => "mean",
            Aggregation::Sum => "sum",
            Aggregation::Median => "median",
            Aggregation::MacroF1 => "macro_f1",
            Aggregation::WeightedF1 => "weighted_f1",
            Aggregation::Pearson => "pearson",
        };
        write!(f, "{name}")
    }
}

fn scalars(samples: &[&MetricSample]) -> Result<Vec<f64>> {
    samples
        .iter()
        .map(|s| match s {
            MetricSample::Scalar(v) => Ok(*v),
            other => bail!("expected a scalar metric sample, got {other:?}"),
        })
        .collect()
}

fn pairs<'a>(samples: &[&'a MetricSample]) -> Result<(Vec<&'a Value>, Vec<&'a Value>)> {
    let mut preds = Vec::with_capacity(samples.len());
    let mut golds = Vec::with_capacity(samples.len());
    for sample in samples {
        match sample {
            MetricSample::Pair { pred, gold } => {
                preds.push(pred);
                golds.push(gold);
            }
            other => bail!("expected a (pred, gold) metric sample, got {other:?}"),
        }
    }
    Ok((preds, golds))
}

fn numbers(values: &[&Value]) -> Result<Vec<f64>> {
    values
        .iter()
        .map(|v| match v {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("{n} is not representable as f64")),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            other => bail!("expected a numeric label, got {other}"),
        })
        .collect()
}

fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mu = mean(values);
    let var = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Per-label F1 and support, over the labels present in `golds`, in first-seen order.
fn per_label_f1(preds: &[&Value], golds: &[&Value]) -> Vec<(f64, usize)> {
    let preds: Vec<String> = preds.iter().map(|v| label(v)).collect();
    let golds: Vec<String> = golds.iter().map(|v| label(v)).collect();
    let labels: IndexSet<&String> = golds.iter().collect();

    labels
        .into_iter()
        .map(|l| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            for (p, g) in preds.iter().zip(&golds) {
                match (p == l, g == l) {
                    (true, true) => tp += 1,
                    (true, false) => fp += 1,
                    (false, true) => fn_ += 1,
                    (false, false) => {}
                }
            }
            let denom = 2 * tp + fp + fn_;
            let f1 = if denom == 0 {
                0.0
            } else {
                (2 * tp) as f64 / denom as f64
            };
            (f1, tp + fn_)
        })
        .collect()
}

pub fn macro_f1(preds: &[&Value], golds: &[&Value]) -> f64 {
    let scores = per_label_f1(preds, golds);
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|(f1, _)| f1).sum::<f64>() / scores.len() as f64
}

pub fn weighted_f1(preds: &[&Value], golds: &[&Value]) -> f64 {
    let scores = per_label_f1(preds, golds);
    let support: usize = scores.iter().map(|(_, s)| s).sum();
    if support == 0 {
        return 0.0;
    }
    scores
        .iter()
        .map(|(f1, s)| f1 * *s as f64)
        .sum::<f64>()
        / support as f64
}

/// Pearson correlation; NaN when either side has zero variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return f64::NAN;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx == 0.0 || vy == 0.0 {
        return f64::NAN;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn refs(samples: &[MetricSample]) -> Vec<&MetricSample> {
        samples.iter().collect()
    }

    #[test]
    fn mean_sum_median() {
        let samples: Vec<MetricSample> = [1.0, 0.0, 1.0, 1.0].map(MetricSample::from).to_vec();
        let samples = refs(&samples);
        assert_relative_eq!(Aggregation::Mean.apply(&samples).unwrap(), 0.75);
        assert_relative_eq!(Aggregation::Sum.apply(&samples).unwrap(), 3.0);
        assert_relative_eq!(Aggregation::Median.apply(&samples).unwrap(), 1.0);
        assert_relative_eq!(median(vec![3.0, 1.0, 2.0, 10.0]), 2.5);
    }

    #[test]
    fn macro_f1_matches_hand_computation() {
        // gold: a a b b, pred: a b b b
        // f1(a) = 2*1/(2+0+1) = 2/3, f1(b) = 2*2/(4+1+0) = 4/5
        let samples = vec![
            MetricSample::pair("a", "a"),
            MetricSample::pair("b", "a"),
            MetricSample::pair("b", "b"),
            MetricSample::pair("b", "b"),
        ];
        let samples = refs(&samples);
        assert_relative_eq!(
            Aggregation::MacroF1.apply(&samples).unwrap(),
            (2.0 / 3.0 + 4.0 / 5.0) / 2.0 * 100.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            Aggregation::WeightedF1.apply(&samples).unwrap(),
            (2.0 / 3.0 * 2.0 + 4.0 / 5.0 * 2.0) / 4.0 * 100.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn f1_ignores_labels_only_predicted() {
        let preds = [json!("x"), json!("a")];
        let golds = [json!("a"), json!("a")];
        let preds: Vec<&Value> = preds.iter().collect();
        let golds: Vec<&Value> = golds.iter().collect();
        assert_relative_eq!(macro_f1(&preds, &golds), 2.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn pearson_correlation() {
        assert_relative_eq!(pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]), 1.0);
        assert_relative_eq!(pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), -1.0);
        assert!(pearson(&[1.0, 1.0], &[1.0, 2.0]).is_nan());
    }

    #[test]
    fn rejects_mismatched_sample_shapes() {
        let samples = vec![MetricSample::Scalar(1.0)];
        assert!(Aggregation::MacroF1.apply(&refs(&samples)).is_err());
        let samples = vec![MetricSample::pair(1, 1)];
        assert!(Aggregation::Mean.apply(&refs(&samples)).is_err());
    }

    #[test]
    fn stddev_uses_n_minus_one() {
        assert_relative_eq!(sample_stddev(&[1.0, 3.0]), 2f64.sqrt());
        assert_eq!(sample_stddev(&[5.0]), 0.0);
    }
}
