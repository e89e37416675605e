//! Attachment manifest written once per dump.
//!
//! Maps every attachment-bearing block to the file stored for it inside the
//! dump directory. Serialized as `manifest.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::utils::errors::{EngineError, Result};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub root_page_id: String,
    pub entries: BTreeMap<String, ManifestEntry>,
}

/// Metadata for a single stored attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative to the dump directory, forward slashes
    pub path: String,
    pub media_type: String,
    pub size: u64,
    pub original_name: String,
    pub source_url: String,
}

impl Manifest {
    pub fn new(root_page_id: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            root_page_id: root_page_id.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Add an entry; keys are unique and paths must stay inside the dump.
    pub fn insert(&mut self, block_id: &str, entry: ManifestEntry) -> Result<()> {
        if !is_confined(&entry.path) {
            return Err(EngineError::Validation(format!(
                "attachment path escapes the dump: {}",
                entry.path
            )));
        }
        if self.entries.contains_key(block_id) {
            return Err(EngineError::Conflict(format!(
                "duplicate manifest entry for block {block_id}"
            )));
        }
        self.entries.insert(block_id.to_string(), entry);
        Ok(())
    }

    pub fn get(&self, block_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(block_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// True for a non-empty relative path made only of normal components.
pub fn is_confined(rel: &str) -> bool {
    if rel.is_empty() || rel.contains('\\') || rel.contains('\0') {
        return false;
    }
    Path::new(rel)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            media_type: "image/png".to_string(),
            size: 10,
            original_name: "a.png".to_string(),
            source_url: "https://s3/a.png".to_string(),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut manifest = Manifest::new("root");
        manifest.insert("b1", entry("assets/b1.png")).unwrap();
        manifest.insert("b2", entry("assets/b2.png")).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.total_bytes(), 20);
        assert_eq!(manifest.get("b1").unwrap().path, "assets/b1.png");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut manifest = Manifest::new("root");
        manifest.insert("b1", entry("assets/b1.png")).unwrap();
        let err = manifest.insert("b1", entry("assets/other.png")).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(manifest.get("b1").unwrap().path, "assets/b1.png");
    }

    #[test]
    fn test_unconfined_paths_rejected() {
        let mut manifest = Manifest::new("root");
        for bad in ["../x.png", "/etc/passwd", "assets/../../x", "", "a\\..\\b", "./a"] {
            assert!(manifest.insert("b", entry(bad)).is_err(), "accepted {bad:?}");
        }
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_is_confined() {
        assert!(is_confined("assets/b1.png"));
        assert!(is_confined("a/b.png"));
        assert!(!is_confined(".."));
        assert!(!is_confined("a/../b"));
    }
}
