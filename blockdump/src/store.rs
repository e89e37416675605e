//! Dump directories under the configured root.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dump::manifest::is_confined;
use crate::dump::snapshot::{Dump, DumpMeta};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::slugify;

/// Listing entry for one dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpSummary {
    pub name: String,
    pub complete: bool,
    pub title: Option<String>,
    pub root_page_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub node_count: u64,
    pub attachment_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DumpStore {
    root: PathBuf,
}

impl DumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Dump names are single path segments.
    pub fn validate_name(name: &str) -> Result<()> {
        let ok = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0'])
            && name != "..";
        if ok {
            Ok(())
        } else {
            Err(EngineError::Validation(format!("invalid dump name: {name:?}")))
        }
    }

    pub fn dump_dir(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Reserve a fresh directory named `<slug(title)>_<YYYYmmdd_HHMMSS>`.
    ///
    /// Directory creation is exclusive, so concurrent dumps of the same page
    /// in the same second get distinct `_2`, `_3`... suffixes.
    pub async fn create_dump_dir(&self, title: &str) -> Result<(String, PathBuf)> {
        self.ensure_root().await?;
        let base = format!(
            "{}_{}",
            slugify(title, "page"),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        for attempt in 1..=100u32 {
            let name = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}_{attempt}")
            };
            let dir = self.root.join(&name);
            match fs::create_dir(&dir).await {
                Ok(()) => {
                    debug!("Allocated dump directory {}", dir.display());
                    return Ok((name, dir));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "could not allocate a directory for {base}"
        )))
    }

    pub async fn open(&self, name: &str) -> Result<Dump> {
        Dump::open(&self.dump_dir(name)?).await
    }

    /// Newest first; directories without readable metadata are listed as
    /// incomplete.
    pub async fn list(&self) -> Result<Vec<DumpSummary>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dumps = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::validate_name(&name).is_err() {
                continue;
            }
            let size_bytes = dir_size(entry.path()).await;
            let summary = match DumpMeta::read(&entry.path()).await {
                Ok(meta) => DumpSummary {
                    name,
                    complete: meta.complete,
                    title: Some(meta.title),
                    root_page_id: Some(meta.root_page_id),
                    created_at: Some(meta.created_at),
                    node_count: meta.node_count,
                    attachment_count: meta.attachment_count,
                    size_bytes,
                },
                Err(e) => {
                    debug!("Unreadable dump metadata in {}: {}", name, e);
                    DumpSummary {
                        name,
                        complete: false,
                        title: None,
                        root_page_id: None,
                        created_at: None,
                        node_count: 0,
                        attachment_count: 0,
                        size_bytes,
                    }
                }
            };
            dumps.push(summary);
        }

        dumps.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(dumps)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let dir = self.dump_dir(name)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Deleted dump {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(format!("dump {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a served path onto a file inside a dump, refusing traversal.
    pub fn resolve_file(&self, name: &str, rel: &str) -> Result<PathBuf> {
        let dir = self.dump_dir(name)?;
        if !is_confined(rel) {
            warn!("Rejected file path outside dump {}: {:?}", name, rel);
            return Err(EngineError::Validation(format!("invalid file path: {rel:?}")));
        }
        Ok(dir.join(rel))
    }
}

async fn dir_size(dir: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    })
    .await
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(DumpStore::validate_name("Roadmap_20240101_120000").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "a\\b"] {
            assert!(DumpStore::validate_name(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[tokio::test]
    async fn test_create_dump_dir_is_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let store = DumpStore::new(root.path());

        let (first, _) = store.create_dump_dir("Team Wiki").await.unwrap();
        let (second, dir) = store.create_dump_dir("Team Wiki").await.unwrap();

        assert!(first.starts_with("Team_Wiki_"));
        assert_ne!(first, second);
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let root = tempfile::tempdir().unwrap();
        let store = DumpStore::new(root.path());

        let (name, dir) = store.create_dump_dir("Doc").await.unwrap();
        let mut meta = DumpMeta::new(&name, "root", "Doc");
        meta.complete = true;
        meta.write(&dir).await.unwrap();
        fs::create_dir(root.path().join("broken")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        let doc = listed.iter().find(|d| d.name == name).unwrap();
        assert!(doc.complete);
        assert!(doc.size_bytes > 0);
        assert!(!listed.iter().find(|d| d.name == "broken").unwrap().complete);

        store.delete(&name).await.unwrap();
        assert!(matches!(store.delete(&name).await, Err(EngineError::NotFound(_))));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let store = DumpStore::new(root.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_resolve_file_refuses_traversal() {
        let store = DumpStore::new("/srv/dumps");
        let ok = store.resolve_file("doc", "assets/b1.png").unwrap();
        assert_eq!(ok, PathBuf::from("/srv/dumps/doc/assets/b1.png"));

        assert!(store.resolve_file("doc", "../other/tree.jsonl").is_err());
        assert!(store.resolve_file("doc", "/etc/passwd").is_err());
        assert!(store.resolve_file("..", "x").is_err());
    }
}
