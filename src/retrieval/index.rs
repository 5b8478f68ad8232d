//! Method index loaded from the external indexer's JSON output.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("method index not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read method index {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed method index {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate method key in index: {0}")]
    DuplicateKey(String),
}

/// Metadata for one indexed method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub key: String,
    pub file: String,
    #[serde(default)]
    pub class: Option<String>,
    pub signature: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// Effect kind (e.g. "writes", "network") to the things affected.
    #[serde(default)]
    pub effects: BTreeMap<String, Vec<String>>,
    /// Keys of the methods that call this one.
    #[serde(default)]
    pub consumers: Vec<String>,
}

#[derive(Deserialize)]
struct IndexFile {
    methods: Vec<IndexedMethod>,
}

#[derive(Deserialize)]
struct IndexedMethod {
    #[serde(flatten)]
    record: MethodRecord,
    #[serde(default)]
    code: Option<String>,
}

/// All indexed methods, in file order, addressable by key.
#[derive(Debug, Clone, Default)]
pub struct MethodIndex {
    records: Vec<MethodRecord>,
    by_key: HashMap<String, usize>,
    code: HashMap<String, String>,
}

impl MethodIndex {
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::Missing(path.to_path_buf()))
            }
            Err(source) => {
                return Err(IndexError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let file: IndexFile = serde_json::from_str(&raw).map_err(|source| IndexError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut index = Self::default();
        for method in file.methods {
            index.insert(method.record, method.code)?;
        }
        tracing::debug!(
            stage = "retrieve",
            path = %path.display(),
            methods = index.len(),
            "method index loaded"
        );
        Ok(index)
    }

    /// Build an index in memory.
    pub fn from_records(
        methods: impl IntoIterator<Item = (MethodRecord, Option<String>)>,
    ) -> Result<Self, IndexError> {
        let mut index = Self::default();
        for (record, code) in methods {
            index.insert(record, code)?;
        }
        Ok(index)
    }

    fn insert(&mut self, record: MethodRecord, code: Option<String>) -> Result<(), IndexError> {
        if self.by_key.contains_key(&record.key) {
            return Err(IndexError::DuplicateKey(record.key));
        }
        if let Some(code) = code {
            self.code.insert(record.key.clone(), code);
        }
        self.by_key.insert(record.key.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&MethodRecord> {
        self.by_key.get(key).map(|&i| &self.records[i])
    }

    pub fn code(&self, key: &str) -> Option<&str> {
        self.code.get(key).map(String::as_str)
    }

    pub fn records(&self) -> &[MethodRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
