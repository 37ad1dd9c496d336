use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

/// One evaluation instance. The harness treats it as opaque; tasks read fields by name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    fn require(&self, field: &str) -> Result<&Value> {
        self.0
            .get(field)
            .ok_or_else(|| anyhow!("document has no field `{field}`"))
    }

    pub fn get_str(&self, field: &str) -> Result<&str> {
        self.require(field)?
            .as_str()
            .ok_or_else(|| anyhow!("field `{field}` is not a string"))
    }

    pub fn get_i64(&self, field: &str) -> Result<i64> {
        match self.require(field)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| anyhow!("field `{field}` is not an integer")),
            Value::Bool(b) => Ok(*b as i64),
            Value::String(s) => s
                .trim()
                .parse()
                .with_context(|| format!("field `{field}` is not an integer")),
            _ => bail!("field `{field}` is not an integer"),
        }
    }

    pub fn get_usize(&self, field: &str) -> Result<usize> {
        let value = self.get_i64(field)?;
        usize::try_from(value).with_context(|| format!("field `{field}` is negative"))
    }

    pub fn get_f64(&self, field: &str) -> Result<f64> {
        match self.require(field)? {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| anyhow!("field `{field}` is not a number")),
            Value::String(s) => s
                .trim()
                .parse()
                .with_context(|| format!("field `{field}` is not a number")),
            _ => bail!("field `{field}` is not a number"),
        }
    }

    pub fn get_bool(&self, field: &str) -> Result<bool> {
        match self.require(field)? {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
            _ => bail!("field `{field}` is not a boolean"),
        }
    }

    pub fn get_array(&self, field: &str) -> Result<&[Value]> {
        self.require(field)?
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("field `{field}` is not an array"))
    }

    pub fn get_strings(&self, field: &str) -> Result<Vec<String>> {
        self.get_array(field)?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow!("field `{field}` has a non-string element"))
            })
            .collect()
    }

    /// Concatenation of the given string fields, used as the similarity-search text.
    pub fn joined_text(&self, fields: &[&str]) -> Result<String> {
        Ok(fields
            .iter()
            .map(|f| self.get_str(f))
            .collect::<Result<Vec<_>>>()?
            .join(" "))
    }
}

impl From<Map<String, Value>> for Document {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl TryFrom<Value> for Document {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => bail!("expected a JSON object, got {other}"),
        }
    }
}

/// Builds a document from a `json!({...})` literal.
#[macro_export]
macro_rules! doc {
    ($($json:tt)+) => {
        $crate::Document::try_from(::serde_json::json!($($json)+))
            .expect("doc! literal must be a JSON object")
    };
}

/// Reads one document per non-empty line.
pub fn load_jsonl(path: &Path) -> Result<Vec<Document>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut docs = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), line_no + 1))?;
        docs.push(
            Document::try_from(value)
                .with_context(|| format!("{}:{}", path.display(), line_no + 1))?,
        );
    }
    Ok(docs)
}
