//! Dump engine - copies a remote page tree into a local dump directory.
//!
//! The walk is depth-first with an explicit stack, so arbitrarily deep pages
//! never grow the call stack. Every node is written to the snapshot as soon
//! as it is visited; attachment downloads run beside the walk on a small
//! bounded pool.

pub mod manifest;
pub mod snapshot;

use futures_util::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{Attachment, BlockNode, PageInfo};
use crate::progress::{format_bytes, CountingStream, ProgressEvent, ProgressSink};
use crate::remote::{fetch_all_children, RemoteClient};
use crate::store::DumpStore;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::sanitize_segment;
use manifest::{Manifest, ManifestEntry};
use snapshot::{write_json_atomic, Dump, DumpMeta, SnapshotRecord, SnapshotWriter, ASSETS_DIR, MANIFEST_FILE};

/// Attachment downloads in flight per dump.
pub const ATTACHMENT_CONCURRENCY: usize = 5;

/// Whole-download attempts when a body stream breaks mid-transfer.
const DOWNLOAD_ATTEMPTS: u32 = 3;

const REMOVE_ATTEMPTS: u32 = 3;

/// Siblings still to visit under one parent.
struct Frame {
    parent_id: String,
    depth: usize,
    pending: VecDeque<BlockNode>,
}

struct Download {
    block_id: String,
    url: String,
    rel_path: String,
    dest: PathBuf,
}

type DownloadResult = Result<(String, ManifestEntry)>;

pub struct DumpEngine {
    client: Arc<dyn RemoteClient>,
}

impl DumpEngine {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    /// Dump `page_id` into a newly allocated directory of `store`.
    ///
    /// A cancelled dump leaves nothing behind. Any other failure leaves the
    /// directory with `complete = false` for inspection.
    pub async fn dump(
        &self,
        page_id: &str,
        store: &DumpStore,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<Dump> {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            page = self.client.fetch_page(page_id) => page?,
        };
        let (name, dir) = store.create_dump_dir(&page.title).await?;
        info!("Dumping page {} ({}) into {}", page.title, page.id, name);
        progress(ProgressEvent::DumpStarted { name: name.clone() });

        let mut downloads: JoinSet<DownloadResult> = JoinSet::new();
        let result = self
            .dump_into(&page, &name, &dir, cancel, &progress, &mut downloads)
            .await;
        if result.is_err() {
            // No download may still be writing once the directory is judged.
            downloads.shutdown().await;
        }

        match result {
            Ok(dump) => Ok(dump),
            Err(EngineError::Cancelled) => {
                remove_dump_dir(&name, &dir).await;
                info!("Dump {} cancelled", name);
                Err(EngineError::Cancelled)
            }
            Err(e) => {
                warn!("Dump {} failed, left incomplete: {}", name, e);
                Err(e)
            }
        }
    }

    async fn dump_into(
        &self,
        page: &PageInfo,
        name: &str,
        dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSink,
        downloads: &mut JoinSet<DownloadResult>,
    ) -> Result<Dump> {
        let started = Instant::now();
        let mut meta = DumpMeta::new(name, &page.id, &page.title);
        meta.write(dir).await?;
        fs::create_dir_all(dir.join(ASSETS_DIR)).await?;

        let mut writer = SnapshotWriter::create(dir).await?;
        let mut manifest = Manifest::new(page.id.clone());
        let limiter = Arc::new(Semaphore::new(ATTACHMENT_CONCURRENCY));
        let mut attachments = 0u64;

        progress(ProgressEvent::Phase("Fetching blocks".to_string()));
        let top = self.children_of(&page.id, cancel).await?;
        let mut stack = vec![Frame {
            parent_id: page.id.clone(),
            depth: 1,
            pending: top.into(),
        }];

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let Some(frame) = stack.last_mut() else { break };
            let next = frame.pending.pop_front();
            let (parent_id, depth) = (frame.parent_id.clone(), frame.depth);
            let Some(mut node) = next else {
                stack.pop();
                continue;
            };

            let block_id = node.id.clone().ok_or_else(|| {
                EngineError::Internal(format!("remote returned a child of {parent_id} without id"))
            })?;

            if let Some(url) = node.remote_file_url().map(str::to_string) {
                let rel_path = attachment_path(&block_id, &url);
                node.attachment = Some(Attachment {
                    source_url: Some(url.clone()),
                    local_path: Some(rel_path.clone()),
                });
                let download = Download {
                    block_id: block_id.clone(),
                    dest: dir.join(&rel_path),
                    url,
                    rel_path,
                };
                downloads.spawn(run_download(
                    self.client.clone(),
                    download,
                    limiter.clone(),
                    cancel.clone(),
                ));
                attachments += 1;
            }

            writer
                .append(&SnapshotRecord::from_node(&node, &block_id, &parent_id, depth))
                .await?;
            progress(ProgressEvent::NodeVisited {
                block_id: block_id.clone(),
                depth,
            });

            while let Some(joined) = downloads.try_join_next() {
                record_download(joined, &mut manifest, progress)?;
            }

            if node.has_children {
                let children = self.children_of(&block_id, cancel).await?;
                stack.push(Frame {
                    parent_id: block_id,
                    depth: depth + 1,
                    pending: children.into(),
                });
            }
        }

        if !downloads.is_empty() {
            progress(ProgressEvent::Phase(format!(
                "Waiting for {} attachment(s)",
                downloads.len()
            )));
        }
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                joined = downloads.join_next() => joined,
            };
            match joined {
                Some(joined) => record_download(joined, &mut manifest, progress)?,
                None => break,
            }
        }

        let nodes = writer.finish().await?;
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest).await?;

        meta.complete = true;
        meta.completed_at = Some(chrono::Utc::now());
        meta.node_count = nodes;
        meta.attachment_count = attachments;
        meta.write(dir).await?;

        info!(
            "Dump {} complete: {} blocks, {} attachments ({}) in {:.1}s",
            name,
            nodes,
            attachments,
            format_bytes(manifest.total_bytes()),
            started.elapsed().as_secs_f64()
        );
        Dump::open(dir).await
    }

    async fn children_of(&self, block_id: &str, cancel: &CancellationToken) -> Result<Vec<BlockNode>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            children = fetch_all_children(self.client.as_ref(), block_id) => Ok(children?),
        }
    }
}

/// Aborted downloads may still have a blocking file operation in flight, so
/// a removal that races one of them is retried.
async fn remove_dump_dir(name: &str, dir: &Path) {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match fs::remove_dir_all(dir).await {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if attempt == REMOVE_ATTEMPTS => {
                warn!("Failed to remove cancelled dump {}: {}", name, e);
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

fn record_download(
    joined: std::result::Result<DownloadResult, JoinError>,
    manifest: &mut Manifest,
    progress: &ProgressSink,
) -> Result<()> {
    let (block_id, entry) =
        joined.map_err(|e| EngineError::Internal(format!("attachment task failed: {e}")))??;
    progress(ProgressEvent::AttachmentTransferred {
        block_id: block_id.clone(),
        bytes: entry.size,
    });
    manifest.insert(&block_id, entry)
}

async fn run_download(
    client: Arc<dyn RemoteClient>,
    download: Download,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
) -> DownloadResult {
    let _permit = limiter
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Internal("download limiter closed".into()))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            r = fetch_to_file(client.as_ref(), &download) => r,
        };
        match result {
            Ok(entry) => return Ok((download.block_id, entry)),
            Err(EngineError::Remote(e)) if e.is_transient() && attempt < DOWNLOAD_ATTEMPTS => {
                warn!(
                    "Download of {} interrupted (attempt {}): {}",
                    download.url, attempt, e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_to_file(client: &dyn RemoteClient, download: &Download) -> Result<ManifestEntry> {
    let body = client.fetch_file(&download.url).await?;

    let partial = download.dest.with_extension("part");
    let mut file = fs::File::create(&partial).await?;
    let mut stream = CountingStream::new(body.stream);
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    drop(file);
    fs::rename(&partial, &download.dest).await?;

    let size = stream.bytes_transferred();
    debug!("Downloaded {} ({})", download.rel_path, format_bytes(size));
    Ok(ManifestEntry {
        path: download.rel_path.clone(),
        media_type: body
            .media_type
            .unwrap_or_else(|| guess_media_type(&download.rel_path).to_string()),
        size,
        original_name: original_name(&download.url),
        source_url: download.url.clone(),
    })
}

fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

fn original_name(url: &str) -> String {
    url_path(url)
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

/// `assets/<block id><ext>`, extension taken from the URL when sane.
pub fn attachment_path(block_id: &str, url: &str) -> String {
    let name = original_name(url);
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| sanitize_segment(ext).to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10)
        .unwrap_or_else(|| "bin".to_string());
    let stem = sanitize_segment(block_id);
    let stem = if stem.is_empty() { "block" } else { stem.as_str() };
    format!("{ASSETS_DIR}/{stem}.{ext}")
}

fn guess_media_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
