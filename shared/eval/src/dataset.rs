use crate::{
    document::load_jsonl,
    fewshot::LexicalIndex,
    Document,
};
use anyhow::{bail, Context, Result};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::OnceLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const fn file_stem(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

/// Per-split document transform. Returning `None` drops the document.
pub type Prepare = fn(Split, Document) -> Result<Option<Document>>;

fn keep(_: Split, doc: Document) -> Result<Option<Document>> {
    Ok(Some(doc))
}

fn cached<'a>(
    cell: &'a OnceLock<Vec<Document>>,
    load: impl FnOnce() -> Result<Vec<Document>>,
) -> Result<&'a [Document]> {
    if let Some(docs) = cell.get() {
        return Ok(docs);
    }
    let docs = load()?;
    Ok(cell.get_or_init(|| docs))
}

/// The splits of one dataset under `<data_dir>/<name>/`, each loaded on first access.
pub struct Dataset {
    name: String,
    dir: Option<PathBuf>,
    prepare: Prepare,
    manual_stem: &'static str,
    train: OnceLock<Vec<Document>>,
    validation: OnceLock<Vec<Document>>,
    test: OnceLock<Vec<Document>>,
    manual: OnceLock<Vec<Document>>,
    index: OnceLock<LexicalIndex>,
}

impl Dataset {
    pub fn new(data_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            dir: Some(data_dir.join(name)),
            prepare: keep,
            manual_stem: "manual",
            train: OnceLock::new(),
            validation: OnceLock::new(),
            test: OnceLock::new(),
            manual: OnceLock::new(),
            index: OnceLock::new(),
        }
    }

    /// A dataset with no backing files; splits are supplied with [`Dataset::with_split`].
    pub fn in_memory(name: &str) -> Self {
        Self {
            dir: None,
            ..Self::new(Path::new(""), name)
        }
    }

    pub fn with_prepare(mut self, prepare: Prepare) -> Self {
        self.prepare = prepare;
        self
    }

    /// Reads curated exemplars from `<manual_stem>.jsonl` instead of `manual.jsonl`.
    pub fn with_manual_stem(mut self, manual_stem: &'static str) -> Self {
        self.manual_stem = manual_stem;
        self
    }

    pub fn with_split(self, split: Split, docs: Vec<Document>) -> Self {
        let _ = self.cell(split).set(docs);
        self
    }

    pub fn with_manual(self, docs: Vec<Document>) -> Self {
        let _ = self.manual.set(docs);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn cell(&self, split: Split) -> &OnceLock<Vec<Document>> {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    fn path(&self, stem: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{stem}.jsonl")))
    }

    pub fn has_split(&self, split: Split) -> bool {
        self.cell(split).get().is_some()
            || self
                .path(split.file_stem())
                .is_some_and(|path| path.is_file())
    }

    pub fn docs(&self, split: Split) -> Result<&[Document]> {
        cached(self.cell(split), || {
            let Some(path) = self
                .path(split.file_stem())
                .filter(|path| path.is_file())
            else {
                bail!("dataset {} has no {split} split", self.name);
            };
            let mut docs = Vec::new();
            for doc in load_jsonl(&path)? {
                if let Some(doc) = (self.prepare)(split, doc)
                    .with_context(|| format!("preparing {}", path.display()))?
                {
                    docs.push(doc);
                }
            }
            tracing::debug!(dataset = %self.name, %split, docs = docs.len(), "Loaded split");
            Ok(docs)
        })
    }

    /// Curated exemplars, empty when the file is absent.
    pub fn manual(&self) -> Result<&[Document]> {
        cached(&self.manual, || match self.path(self.manual_stem) {
            Some(path) if path.is_file() => load_jsonl(&path),
            _ => Ok(vec![]),
        })
    }

    /// BM25 index over the training split, built on first use.
    pub fn lexical_index(&self, fields: &[&'static str]) -> Result<&LexicalIndex> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let index = LexicalIndex::build(self.docs(Split::Train)?, fields)?;
        Ok(self.index.get_or_init(|| index))
    }
}
