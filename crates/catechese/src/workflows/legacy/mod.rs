//! Historical parent and catechumen records used by the re-enrollment branch.

mod mapping;
mod normalizer;
mod parser;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::RwLock;

use crate::workflows::enrollment::domain::ClassLevel;

pub(crate) use normalizer::normalize_label;
pub use normalizer::{normalize_phone, phone_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyParent {
    pub code: String,
    pub last_name: String,
    pub first_name: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyCatechumen {
    pub code: String,
    pub parent_code: String,
    pub last_name: String,
    pub first_names: String,
    pub birth_date: Option<NaiveDate>,
    pub birth_year: Option<i32>,
    pub last_level: Option<ClassLevel>,
}

impl LegacyCatechumen {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.last_name.to_uppercase(), self.first_names)
    }
}

/// Read access to the historical register.
pub trait LegacyDirectory: Send + Sync {
    fn lookup_legacy_parent(&self, phone: &str) -> Result<Option<LegacyParent>, LegacyLookupError>;
    fn legacy_catechumens(
        &self,
        parent_code: &str,
    ) -> Result<Vec<LegacyCatechumen>, LegacyLookupError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LegacyLookupError {
    #[error("legacy register unavailable: {0}")]
    Unavailable(String),
}

/// Directory held in memory, keyed by the local part of the parent's phone number.
#[derive(Debug, Default)]
pub struct InMemoryLegacyDirectory {
    parents: RwLock<HashMap<String, LegacyParent>>,
    children: RwLock<HashMap<String, Vec<LegacyCatechumen>>>,
}

impl InMemoryLegacyDirectory {
    pub fn insert_parent(&self, parent: LegacyParent) {
        let key = phone_key(&parent.phone);
        if key.is_empty() {
            return;
        }
        if let Ok(mut parents) = self.parents.write() {
            parents.entry(key).or_insert(parent);
        }
    }

    pub fn insert_catechumen(&self, child: LegacyCatechumen) {
        if let Ok(mut children) = self.children.write() {
            let siblings = children.entry(child.parent_code.clone()).or_default();
            if !siblings.iter().any(|existing| existing.code == child.code) {
                siblings.push(child);
            }
        }
    }

    pub fn parent_count(&self) -> usize {
        self.parents.read().map(|parents| parents.len()).unwrap_or(0)
    }

    pub fn catechumen_count(&self) -> usize {
        self.children
            .read()
            .map(|children| children.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl LegacyDirectory for InMemoryLegacyDirectory {
    fn lookup_legacy_parent(&self, phone: &str) -> Result<Option<LegacyParent>, LegacyLookupError> {
        let key = phone_key(phone);
        if key.is_empty() {
            return Ok(None);
        }
        let parents = self
            .parents
            .read()
            .map_err(|_| LegacyLookupError::Unavailable("parent index poisoned".to_string()))?;
        Ok(parents.get(&key).cloned())
    }

    fn legacy_catechumens(
        &self,
        parent_code: &str,
    ) -> Result<Vec<LegacyCatechumen>, LegacyLookupError> {
        let children = self
            .children
            .read()
            .map_err(|_| LegacyLookupError::Unavailable("child index poisoned".to_string()))?;
        Ok(children.get(parent_code).cloned().unwrap_or_default())
    }
}

#[derive(Debug)]
pub enum LegacyImportError {
    Io(std::io::Error),
    Csv(csv::Error),
}

impl std::fmt::Display for LegacyImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegacyImportError::Io(err) => write!(f, "failed to read legacy register: {}", err),
            LegacyImportError::Csv(err) => write!(f, "invalid legacy register CSV: {}", err),
        }
    }
}

impl std::error::Error for LegacyImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LegacyImportError::Io(err) => Some(err),
            LegacyImportError::Csv(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for LegacyImportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for LegacyImportError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err)
    }
}

/// Loads the CSV export of the historical register.
pub struct LegacyImporter;

impl LegacyImporter {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<InMemoryLegacyDirectory, LegacyImportError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<InMemoryLegacyDirectory, LegacyImportError> {
        let directory = InMemoryLegacyDirectory::default();

        for row in parser::parse_rows(reader)? {
            let parent_code = row.parent_code.clone();
            directory.insert_parent(LegacyParent {
                code: row.parent_code,
                last_name: row.parent_last_name,
                first_name: row.parent_first_name,
                phone: normalize_phone(&row.phone),
            });

            if let Some(child) = row.child {
                directory.insert_catechumen(LegacyCatechumen {
                    code: child.code,
                    parent_code,
                    last_name: child.last_name,
                    first_names: child.first_names,
                    birth_date: child.birth_date,
                    birth_year: child.birth_year,
                    last_level: child.level.as_deref().and_then(mapping::level_for_label),
                });
            }
        }

        tracing::info!(
            parents = directory.parent_count(),
            catechumens = directory.catechumen_count(),
            "legacy register loaded"
        );

        Ok(directory)
    }
}
