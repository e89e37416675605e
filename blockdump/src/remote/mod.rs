//! Capability-limited access to the remote content API.
//!
//! Engines only ever see [`RemoteClient`]; reliability is layered on by
//! wrapping a concrete client in [`RetryingClient`].

pub mod http;
pub mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::model::{BlockNode, ChildrenPage, PageInfo};
use crate::utils::errors::RemoteError;

pub use http::HttpClient;
pub use retry::{RetryPolicy, RetryingClient};

/// A downloadable file body.
pub struct FileBody {
    /// Declared media type, when the remote sent one
    pub media_type: Option<String>,
    pub stream: BoxStream<'static, Result<Bytes, RemoteError>>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn fetch_page(&self, page_id: &str) -> Result<PageInfo, RemoteError>;

    /// One page of direct children, in remote-declared order.
    async fn fetch_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError>;

    async fn fetch_file(&self, url: &str) -> Result<FileBody, RemoteError>;

    /// Append `children` under `parent_id`; returns one new id per submitted
    /// node, in submission order.
    async fn append_children(
        &self,
        parent_id: &str,
        children: &[BlockNode],
    ) -> Result<Vec<String>, RemoteError>;

    /// Replace the payload of an existing block.
    async fn update_block(&self, block_id: &str, block: &BlockNode) -> Result<(), RemoteError>;
}

/// Drain every page of a node's children.
pub async fn fetch_all_children(
    client: &dyn RemoteClient,
    block_id: &str,
) -> Result<Vec<BlockNode>, RemoteError> {
    let mut blocks = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = client.fetch_children(block_id, cursor.as_deref()).await?;
        blocks.extend(page.blocks);
        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }
    Ok(blocks)
}
