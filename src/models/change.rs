use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::WatchedField;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Classification of one identity after reconciliation. "Unchanged" has no
/// event at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub changed_fields: BTreeMap<WatchedField, FieldChange>,
}

impl ChangeEvent {
    pub fn new_deal() -> Self {
        Self {
            kind: ChangeKind::New,
            changed_fields: BTreeMap::new(),
        }
    }

    /// `None` when nothing watched changed
    pub fn updated(changed_fields: BTreeMap<WatchedField, FieldChange>) -> Option<Self> {
        if changed_fields.is_empty() {
            return None;
        }
        Some(Self {
            kind: ChangeKind::Updated,
            changed_fields,
        })
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            ChangeKind::New => "New deal",
            ChangeKind::Updated => "Updated deal",
        }
    }
}
