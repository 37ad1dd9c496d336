use crate::{fewshot::PromptMode, metrics::Metrics, prompt::Prompt};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

/// Human-readable per-document log of generation prompts and predictions,
/// one append-only file per (task, prompt mode).
#[derive(Debug, Clone)]
pub struct SampleLog {
    dir: PathBuf,
}

impl SampleLog {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    pub fn path(&self, task_name: &str, prompt_mode: PromptMode) -> PathBuf {
        self.dir
            .join(format!("{task_name}_{prompt_mode}_samples.txt"))
    }

    /// Removes a log left over from an earlier run.
    pub fn reset(&self, task_name: &str, prompt_mode: PromptMode) -> Result<()> {
        let path = self.path(task_name, prompt_mode);
        if path.is_file() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }

    pub fn append(
        &self,
        task_name: &str,
        prompt_mode: PromptMode,
        doc_id: usize,
        prompt: &Prompt,
        prediction: &str,
        metrics: &Metrics,
    ) -> Result<()> {
        let record = format_record(doc_id, prompt, prediction, metrics)?;
        let path = self.path(task_name, prompt_mode);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(record.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn pretty_json(value: &impl Serialize) -> Result<String> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out)?)
}

pub fn format_record(
    doc_id: usize,
    prompt: &Prompt,
    prediction: &str,
    metrics: &Metrics,
) -> Result<String> {
    let rule = "--".repeat(10);
    Ok(format!(
        "{stars}doc_id: {doc_id}\n\
         ------------------------prompt------------------------------------\n\
         {prompt}\n\
         {rule}Prediction{rule}\n\
         {prediction}\n\
         {hashes}\n\
         Metrics: {metrics}\n",
        stars = "*".repeat(50),
        hashes = "##".repeat(50),
        metrics = pretty_json(metrics)?,
    ))
}
