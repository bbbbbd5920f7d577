//! Field projections applied to outgoing documents.

use super::{get_path, remove_path, set_path};
use crate::types::{Document, ID_FIELD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionMode {
    Include,
    Exclude,
}

/// Inclusion or exclusion list of (possibly dotted) fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub mode: ProjectionMode,
    pub fields: Vec<String>,
}

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: ProjectionMode::Include,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: ProjectionMode::Exclude,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `_id` would be stripped from projected documents.
    pub fn excludes_id(&self) -> bool {
        let listed = self.fields.iter().any(|f| f == ID_FIELD);
        match self.mode {
            ProjectionMode::Exclude => listed,
            // Inclusion keeps `_id` implicitly.
            ProjectionMode::Include => false,
        }
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self.mode {
            ProjectionMode::Include => {
                let mut out = Document::new();
                if let Some(id) = doc.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
                for field in &self.fields {
                    if let Some(value) = get_path(doc, field) {
                        // Paths into non-objects cannot be recreated; skip them.
                        let _ = set_path(&mut out, field, value.clone());
                    }
                }
                out
            }
            ProjectionMode::Exclude => {
                let mut out = doc.clone();
                for field in &self.fields {
                    remove_path(&mut out, field);
                }
                out
            }
        }
    }
}
