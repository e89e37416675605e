//! In-memory [`RemoteClient`] used by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::model::{BlockNode, ChildrenPage, PageInfo};
use crate::remote::{FileBody, RemoteClient};
use crate::utils::errors::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FetchPage,
    FetchChildren,
    FetchFile,
    Append,
    Update,
}

#[derive(Default)]
struct State {
    titles: HashMap<String, String>,
    nodes: HashMap<String, BlockNode>,
    children: HashMap<String, Vec<String>>,
    files: HashMap<String, (Option<String>, Vec<u8>)>,
    page_size: Option<usize>,
    rejected_kinds: HashSet<String>,
    failures: HashMap<Op, VecDeque<RemoteError>>,
    calls: HashMap<Op, usize>,
    gates: HashMap<Op, (usize, Arc<Semaphore>)>,
    updates: Vec<(String, BlockNode)>,
    next_id: u64,
}

impl State {
    fn exists(&self, id: &str) -> bool {
        self.titles.contains_key(id) || self.nodes.contains_key(id)
    }

    fn insert_subtree(&mut self, parent_id: &str, children: Vec<BlockNode>, prefix: &str) -> Vec<String> {
        let mut created = Vec::with_capacity(children.len());
        let mut queue: VecDeque<(String, Vec<BlockNode>)> = VecDeque::new();
        queue.push_back((parent_id.to_string(), children));

        while let Some((parent, nodes)) = queue.pop_front() {
            for mut node in nodes {
                self.next_id += 1;
                let id = match node.id.take() {
                    Some(id) if prefix == "src" => id,
                    _ => format!("{prefix}-{}", self.next_id),
                };
                let grandchildren = std::mem::take(&mut node.children);
                node.has_children = !grandchildren.is_empty();
                node.id = Some(id.clone());
                node.attachment = None;
                self.nodes.insert(id.clone(), node);
                self.children.entry(parent.clone()).or_default().push(id.clone());
                if parent == parent_id {
                    created.push(id.clone());
                }
                if !grandchildren.is_empty() {
                    queue.push_back((id, grandchildren));
                }
            }
        }
        created
    }
}

/// Scriptable fake of the remote API. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Register a page and its block tree. Nodes keep their ids when given.
    pub fn add_page(&self, id: &str, title: &str, children: Vec<BlockNode>) {
        let mut state = self.lock();
        state.titles.insert(id.to_string(), title.to_string());
        state.children.entry(id.to_string()).or_default();
        state.insert_subtree(id, children, "src");
    }

    pub fn add_file(&self, url: &str, media_type: Option<&str>, body: &[u8]) {
        self.lock()
            .files
            .insert(url.to_string(), (media_type.map(str::to_string), body.to_vec()));
    }

    pub fn set_page_size(&self, size: usize) {
        self.lock().page_size = Some(size.max(1));
    }

    /// Appends containing a block of this type fail as invalid requests.
    pub fn reject_kind(&self, kind: &str) {
        self.lock().rejected_kinds.insert(kind.to_string());
    }

    pub fn fail_next(&self, op: Op, err: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Calls of `op` beyond the first `after` each wait for one permit.
    pub fn gate(&self, op: Op, after: usize) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        self.lock().gates.insert(op, (after, semaphore.clone()));
        semaphore
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn block(&self, id: &str) -> Option<BlockNode> {
        self.lock().nodes.get(id).cloned()
    }

    /// Children of `id` with their subtrees, in order.
    pub fn tree(&self, id: &str) -> Vec<BlockNode> {
        let state = self.lock();
        build_tree(&state, id)
    }

    pub fn updates(&self) -> Vec<(String, BlockNode)> {
        self.lock().updates.clone()
    }

    async fn enter(&self, op: Op) -> Result<(), RemoteError> {
        let gate = {
            let mut state = self.lock();
            let count = state.calls.entry(op).or_insert(0);
            *count += 1;
            let count = *count;
            state
                .gates
                .get(&op)
                .filter(|(after, _)| count > *after)
                .map(|(_, semaphore)| semaphore.clone())
        };
        if let Some(semaphore) = gate {
            if let Ok(permit) = semaphore.acquire().await {
                permit.forget();
            }
        }
        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn build_tree(state: &State, id: &str) -> Vec<BlockNode> {
    state
        .children
        .get(id)
        .map(|ids| {
            ids.iter()
                .filter_map(|child| {
                    let mut node = state.nodes.get(child)?.clone();
                    node.children = build_tree(state, child);
                    Some(node)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn fetch_page(&self, page_id: &str) -> Result<PageInfo, RemoteError> {
        self.enter(Op::FetchPage).await?;
        let state = self.lock();
        let title = state
            .titles
            .get(page_id)
            .ok_or_else(|| RemoteError::NotFound(format!("page {page_id}")))?;
        Ok(PageInfo {
            id: page_id.to_string(),
            title: title.clone(),
        })
    }

    async fn fetch_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError> {
        self.enter(Op::FetchChildren).await?;
        let state = self.lock();
        if !state.exists(block_id) {
            return Err(RemoteError::NotFound(format!("block {block_id}")));
        }
        let ids = state.children.get(block_id).cloned().unwrap_or_default();
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = state
            .page_size
            .map_or(ids.len(), |size| (start + size).min(ids.len()));
        let blocks = ids[start.min(ids.len())..end]
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();
        let next_cursor = (end < ids.len()).then(|| end.to_string());
        Ok(ChildrenPage { blocks, next_cursor })
    }

    async fn fetch_file(&self, url: &str) -> Result<FileBody, RemoteError> {
        self.enter(Op::FetchFile).await?;
        let (media_type, body) = self
            .lock()
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("file {url}")))?;
        let mid = body.len() / 2;
        let chunks: Vec<Result<Bytes, RemoteError>> = vec![
            Ok(Bytes::copy_from_slice(&body[..mid])),
            Ok(Bytes::copy_from_slice(&body[mid..])),
        ];
        Ok(FileBody {
            media_type,
            stream: futures_util::stream::iter(chunks).boxed(),
        })
    }

    async fn append_children(
        &self,
        parent_id: &str,
        children: &[BlockNode],
    ) -> Result<Vec<String>, RemoteError> {
        self.enter(Op::Append).await?;
        let mut state = self.lock();
        if !state.exists(parent_id) {
            return Err(RemoteError::NotFound(format!("parent {parent_id}")));
        }
        if let Some(bad) = children
            .iter()
            .find(|c| state.rejected_kinds.contains(&c.kind))
        {
            return Err(RemoteError::InvalidRequest(format!(
                "block type {} is not supported",
                bad.kind
            )));
        }
        let ids = state.insert_subtree(parent_id, children.to_vec(), "new");
        if let Some(parent) = state.nodes.get_mut(parent_id) {
            parent.has_children = true;
        }
        Ok(ids)
    }

    async fn update_block(&self, block_id: &str, block: &BlockNode) -> Result<(), RemoteError> {
        self.enter(Op::Update).await?;
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(block_id)
            .ok_or_else(|| RemoteError::NotFound(format!("block {block_id}")))?;
        node.payload = block.payload.clone();
        state.updates.push((block_id.to_string(), block.clone()));
        Ok(())
    }
}
