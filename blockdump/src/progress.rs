//! Progress reporting from the engines to whoever runs them.

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::utils::errors::RemoteError;

/// A single progress step reported by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The dump directory was allocated
    DumpStarted { name: String },
    /// A block was visited (dump) and persisted to the snapshot
    NodeVisited { block_id: String, depth: usize },
    /// An attachment finished downloading
    AttachmentTransferred { block_id: String, bytes: u64 },
    /// A batch of blocks was created remotely (migration)
    BlocksCreated { parent_id: String, count: usize },
    /// Free-form phase change
    Phase(String),
}

/// Callback receiving progress events; must not block.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A sink that drops everything.
pub fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}

/// Cumulative counters for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub blocks_processed: u64,
    pub attachments_transferred: u64,
    pub bytes_transferred: u64,
    pub blocks_created: u64,
}

impl JobProgress {
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::NodeVisited { .. } => self.blocks_processed += 1,
            ProgressEvent::AttachmentTransferred { bytes, .. } => {
                self.attachments_transferred += 1;
                self.bytes_transferred += bytes;
            }
            ProgressEvent::BlocksCreated { count, .. } => self.blocks_created += *count as u64,
            ProgressEvent::DumpStarted { .. } | ProgressEvent::Phase(_) => {}
        }
    }
}

/// Stream wrapper that counts bytes flowing through it.
pub struct CountingStream<S> {
    inner: S,
    bytes_transferred: u64,
}

impl<S> CountingStream<S>
where
    S: Stream<Item = Result<Bytes, RemoteError>>,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
        }
    }

    /// Get total bytes transferred
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, RemoteError>> + Unpin,
{
    type Item = Result<Bytes, RemoteError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_job_progress_apply() {
        let mut progress = JobProgress::default();
        progress.apply(&ProgressEvent::NodeVisited { block_id: "a".into(), depth: 1 });
        progress.apply(&ProgressEvent::NodeVisited { block_id: "b".into(), depth: 2 });
        progress.apply(&ProgressEvent::AttachmentTransferred { block_id: "b".into(), bytes: 512 });
        progress.apply(&ProgressEvent::BlocksCreated { parent_id: "p".into(), count: 3 });
        progress.apply(&ProgressEvent::Phase("done".into()));

        assert_eq!(progress.blocks_processed, 2);
        assert_eq!(progress.attachments_transferred, 1);
        assert_eq!(progress.bytes_transferred, 512);
        assert_eq!(progress.blocks_created, 3);
    }

    #[tokio::test]
    async fn test_counting_stream() {
        let chunks: Vec<Result<Bytes, RemoteError>> =
            vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"defgh"))];
        let mut stream = CountingStream::new(futures_util::stream::iter(chunks));
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        assert_eq!(stream.bytes_transferred(), 8);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
    }
}
