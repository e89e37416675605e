//! Block tree types shared by the remote client and both engines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Block types whose payload may point at a hosted file.
pub const ATTACHMENT_TYPES: &[&str] = &["image", "file", "pdf", "video", "audio"];

/// One node of a remote document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    /// Remote identifier; `None` for nodes that do not exist remotely yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific content, opaque apart from attachment references
    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub has_children: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// Where an attachment lives: remotely before a dump, locally after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    /// Path relative to the dump directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl BlockNode {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload,
            has_children: false,
            children: Vec::new(),
            attachment: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_children(mut self, children: Vec<BlockNode>) -> Self {
        self.has_children = !children.is_empty();
        self.children = children;
        self
    }

    /// URL of the hosted file referenced by the payload, if any.
    ///
    /// Both `file` (remote-hosted) and `external` variants count.
    pub fn remote_file_url(&self) -> Option<&str> {
        if !ATTACHMENT_TYPES.contains(&self.kind.as_str()) {
            return None;
        }
        ["file", "external"].iter().find_map(|variant| {
            self.payload
                .get(variant)
                .and_then(|f| f.get("url"))
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())
        })
    }

    /// Number of nodes in this subtree, self included.
    pub fn subtree_len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

/// Page-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub id: String,
    pub title: String,
}

/// One page of a node's direct children.
#[derive(Debug, Clone, Default)]
pub struct ChildrenPage {
    pub blocks: Vec<BlockNode>,
    /// Present when more children remain
    pub next_cursor: Option<String>,
}
