//! On-disk layout of a dump.
//!
//! ```text
//! <dump_root>/<name>/
//!   dump.json       metadata, `complete` flips to true last
//!   tree.jsonl      one record per block, depth-first pre-order
//!   manifest.json   attachment index
//!   assets/         downloaded files
//! ```
//!
//! The tree is stored flat so that neither writing nor reading it recurses,
//! whatever the depth of the original page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use super::manifest::Manifest;
use crate::model::{Attachment, BlockNode};
use crate::utils::errors::{EngineError, Result};

pub const FORMAT_VERSION: u32 = 1;
pub const META_FILE: &str = "dump.json";
pub const TREE_FILE: &str = "tree.jsonl";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ASSETS_DIR: &str = "assets";

/// One block as persisted in `tree.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub parent_id: String,
    /// 1 for direct children of the page
    pub depth: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub has_children: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl SnapshotRecord {
    pub fn from_node(node: &BlockNode, id: &str, parent_id: &str, depth: usize) -> Self {
        Self {
            id: id.to_string(),
            parent_id: parent_id.to_string(),
            depth,
            kind: node.kind.clone(),
            payload: node.payload.clone(),
            has_children: node.has_children,
            attachment: node.attachment.clone(),
        }
    }

    /// Childless node carrying the record's content.
    pub fn to_node(&self) -> BlockNode {
        BlockNode {
            id: Some(self.id.clone()),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            has_children: self.has_children,
            children: Vec::new(),
            attachment: self.attachment.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpMeta {
    pub format_version: u32,
    pub name: String,
    pub root_page_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub complete: bool,
    #[serde(default)]
    pub node_count: u64,
    #[serde(default)]
    pub attachment_count: u64,
}

impl DumpMeta {
    pub fn new(name: &str, root_page_id: &str, title: &str) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            name: name.to_string(),
            root_page_id: root_page_id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
            completed_at: None,
            complete: false,
            node_count: 0,
            attachment_count: 0,
        }
    }

    pub async fn read(dir: &Path) -> Result<Self> {
        let raw = fs::read(dir.join(META_FILE)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Replace `dump.json` atomically.
    pub async fn write(&self, dir: &Path) -> Result<()> {
        write_json_atomic(&dir.join(META_FILE), self).await
    }
}

pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Appends records to `tree.jsonl` as the walk produces them.
pub struct SnapshotWriter {
    out: BufWriter<fs::File>,
    records: u64,
}

impl SnapshotWriter {
    pub async fn create(dir: &Path) -> Result<Self> {
        let file = fs::File::create(dir.join(TREE_FILE)).await?;
        Ok(Self {
            out: BufWriter::new(file),
            records: 0,
        })
    }

    pub async fn append(&mut self, record: &SnapshotRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub async fn finish(mut self) -> Result<u64> {
        self.out.flush().await?;
        self.out.get_ref().sync_all().await?;
        Ok(self.records)
    }
}

/// A dump directory opened for reading.
#[derive(Debug, Clone)]
pub struct Dump {
    pub dir: PathBuf,
    pub meta: DumpMeta,
}

impl Dump {
    pub async fn open(dir: &Path) -> Result<Self> {
        let meta = DumpMeta::read(dir).await.map_err(|e| match e {
            EngineError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                EngineError::NotFound(format!("no dump at {}", dir.display()))
            }
            other => other,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
        })
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn is_complete(&self) -> bool {
        self.meta.complete
    }

    /// Fail unless the dump finished successfully.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.meta.complete {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "dump {} is incomplete",
                self.meta.name
            )))
        }
    }

    pub async fn manifest(&self) -> Result<Manifest> {
        let raw = fs::read(self.dir.join(MANIFEST_FILE)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// All records in file order.
    pub async fn records(&self) -> Result<Vec<SnapshotRecord>> {
        let file = fs::File::open(self.dir.join(TREE_FILE)).await?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Rebuild the nested tree rooted at the page.
    pub async fn load_tree(&self) -> Result<BlockNode> {
        let records = self.records().await?;
        let children = assemble(&self.meta.root_page_id, records)?;
        Ok(BlockNode::new("page", json!({ "title": self.meta.title }))
            .with_id(self.meta.root_page_id.clone())
            .with_children(children))
    }
}

/// Nest pre-order records under `root_id`, children in file order.
pub fn assemble(root_id: &str, records: Vec<SnapshotRecord>) -> Result<Vec<BlockNode>> {
    let mut pending: HashMap<String, Vec<BlockNode>> = HashMap::new();

    // Reverse pre-order visits every node after all of its descendants.
    for record in records.into_iter().rev() {
        let mut node = record.to_node();
        if let Some(mut children) = pending.remove(&record.id) {
            children.reverse();
            node.children = children;
        }
        pending.entry(record.parent_id).or_default().push(node);
    }

    let mut top = pending.remove(root_id).unwrap_or_default();
    if let Some(orphan_parent) = pending.keys().next() {
        return Err(EngineError::Validation(format!(
            "snapshot references unknown parent {orphan_parent}"
        )));
    }
    top.reverse();
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, parent: &str, depth: usize, has_children: bool) -> SnapshotRecord {
        SnapshotRecord {
            id: id.to_string(),
            parent_id: parent.to_string(),
            depth,
            kind: "paragraph".to_string(),
            payload: json!({ "text": id }),
            has_children,
            attachment: None,
        }
    }

    #[test]
    fn test_assemble_preserves_order_and_nesting() {
        let records = vec![
            record("a", "root", 1, true),
            record("a1", "a", 2, false),
            record("a2", "a", 2, true),
            record("a2x", "a2", 3, false),
            record("b", "root", 1, false),
        ];
        let tree = assemble("root", records).unwrap();
        let ids: Vec<_> = tree.iter().map(|n| n.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let a_children: Vec<_> = tree[0].children.iter().map(|n| n.id.clone().unwrap()).collect();
        assert_eq!(a_children, vec!["a1", "a2"]);
        assert_eq!(tree[0].children[1].children[0].id.as_deref(), Some("a2x"));
    }

    #[test]
    fn test_assemble_rejects_orphans() {
        let records = vec![record("a", "root", 1, false), record("x", "ghost", 2, false)];
        assert!(assemble("root", records).is_err());
    }

    #[test]
    fn test_assemble_deep_chain_without_recursion() {
        let depth = 5_000;
        let mut records = Vec::with_capacity(depth);
        let mut parent = "root".to_string();
        for i in 0..depth {
            let id = format!("n{i}");
            records.push(record(&id, &parent, i + 1, i + 1 < depth));
            parent = id;
        }
        let tree = assemble("root", records).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].subtree_len(), depth);
        // Unwind iteratively so the drop does not recurse either.
        let mut stack = tree;
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }

    #[tokio::test]
    async fn test_writer_and_reader() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = DumpMeta::new("doc_20240101_000000", "root", "Doc");
        meta.write(dir.path()).await.unwrap();

        let mut writer = SnapshotWriter::create(dir.path()).await.unwrap();
        writer.append(&record("a", "root", 1, true)).await.unwrap();
        writer.append(&record("a1", "a", 2, false)).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 2);

        let dump = Dump::open(dir.path()).await.unwrap();
        assert!(!dump.is_complete());
        assert!(dump.ensure_complete().is_err());

        meta.complete = true;
        meta.write(dir.path()).await.unwrap();
        let dump = Dump::open(dir.path()).await.unwrap();
        dump.ensure_complete().unwrap();

        let tree = dump.load_tree().await.unwrap();
        assert_eq!(tree.id.as_deref(), Some("root"));
        assert_eq!(tree.payload["title"], "Doc");
        assert_eq!(tree.subtree_len(), 3);
    }

    #[tokio::test]
    async fn test_open_missing_dump() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dump::open(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
