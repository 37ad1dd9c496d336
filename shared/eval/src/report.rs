use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Aggregated metrics of one (task, prompt mode).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeResults {
    #[serde(flatten)]
    pub metrics: IndexMap<String, f64>,
    pub num_examples: usize,
}

/// How the run was configured, echoed into the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: String,
    pub model_args: String,
    pub num_fewshot: usize,
    pub prompt_modes: Vec<String>,
    pub batch_size: Option<usize>,
    pub limit: Option<usize>,
    pub bootstrap_iters: usize,
    pub seed: u64,
    pub no_cache: bool,
    pub description_dict: IndexMap<String, String>,
    pub conversation_template: Option<String>,
    pub prompt_as_single_user_message: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    /// task -> prompt mode -> metrics
    pub results: IndexMap<String, IndexMap<String, ModeResults>>,
    pub versions: IndexMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
}

impl EvalResults {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

const HEADERS: [&str; 7] = ["Task", "Prompt", "Version", "Metric", "Value", "", "Stderr"];
const RIGHT_ALIGNED: [bool; 7] = [false, false, true, false, true, false, true];

/// Markdown table of every metric, with task, prompt and version printed once per group.
pub fn make_table(results: &EvalResults) -> String {
    let mut rows: Vec<[String; 7]> = Vec::new();
    for (task, modes) in &results.results {
        let version = results
            .versions
            .get(task)
            .map(u32::to_string)
            .unwrap_or_default();
        let mut task_cell = task.clone();
        let mut version_cell = version;
        for (mode, mode_results) in modes {
            let mut mode_cell = mode.clone();
            let metric_rows = mode_results
                .metrics
                .iter()
                .filter(|(metric, _)| !metric.ends_with("_stderr"))
                .map(|(metric, value)| {
                    let stderr = mode_results.metrics.get(&format!("{metric}_stderr"));
                    (
                        metric.clone(),
                        format!("{value:.4}"),
                        stderr.map(|_| "±".to_string()).unwrap_or_default(),
                        stderr.map(|s| format!("{s:.4}")).unwrap_or_default(),
                    )
                })
                .chain(std::iter::once((
                    "num_examples".to_string(),
                    mode_results.num_examples.to_string(),
                    String::new(),
                    String::new(),
                )));
            for (metric, value, pm, stderr) in metric_rows {
                rows.push([
                    std::mem::take(&mut task_cell),
                    std::mem::take(&mut mode_cell),
                    std::mem::take(&mut version_cell),
                    metric,
                    value,
                    pm,
                    stderr,
                ]);
            }
        }
    }

    let mut widths = HEADERS.map(|h| h.chars().count().max(3));
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let render = |out: &mut String, cells: &[String]| {
        out.push('|');
        for ((cell, width), right) in cells.iter().zip(widths).zip(RIGHT_ALIGNED) {
            let pad = width - cell.chars().count();
            if right {
                let _ = write!(out, "{}{cell}|", " ".repeat(pad));
            } else {
                let _ = write!(out, "{cell}{}|", " ".repeat(pad));
            }
        }
        out.push('\n');
    };

    render(&mut out, &HEADERS.map(String::from));
    out.push('|');
    for (width, right) in widths.iter().zip(RIGHT_ALIGNED) {
        if right {
            let _ = write!(out, "{}:|", "-".repeat(width - 1));
        } else {
            let _ = write!(out, "{}|", "-".repeat(*width));
        }
    }
    out.push('\n');
    for row in &rows {
        render(&mut out, row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn results() -> EvalResults {
        let fixed = ModeResults {
            metrics: IndexMap::from([
                ("acc".to_string(), 0.5),
                ("acc_stderr".to_string(), 0.125),
                ("f1".to_string(), 40.0),
            ]),
            num_examples: 8,
        };
        EvalResults {
            results: IndexMap::from([(
                "boolq_pt".to_string(),
                IndexMap::from([("fixed".to_string(), fixed)]),
            )]),
            versions: IndexMap::from([("boolq_pt".to_string(), 0)]),
            config: None,
        }
    }

    #[test]
    fn json_flattens_metrics_next_to_count() {
        let json: serde_json::Value = serde_json::from_str(&results().to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "results": {
                    "boolq_pt": {
                        "fixed": {
                            "acc": 0.5,
                            "acc_stderr": 0.125,
                            "f1": 40.0,
                            "num_examples": 8
                        }
                    }
                },
                "versions": { "boolq_pt": 0 }
            })
        );
        let back: EvalResults = serde_json::from_str(&results().to_json().unwrap()).unwrap();
        assert_eq!(back, results());
    }

    #[test]
    fn table_rows() {
        let table = make_table(&results());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2 + 3);
        assert!(lines[0].starts_with("|Task    |Prompt|Version|Metric"));
        assert!(lines[2].starts_with("|boolq_pt|fixed |      0|acc "));
        assert!(lines[2].contains("0.5000|±  |0.1250|"));
        assert!(lines[3].starts_with("|        |      |       |f1"));
        assert!(lines[4].contains("num_examples"));
    }
}
