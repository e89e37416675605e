//! Migration engine - rebuilds a dump under a new remote parent.
//!
//! Blocks are created parent by parent from an explicit work queue, in
//! batches the remote accepts in one call. New ids are recorded as they come
//! back, so children can be attached to their freshly created parents and
//! cross references inside payloads can be rewritten.

pub mod rewrite;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dump::manifest::Manifest;
use crate::dump::snapshot::{Dump, SnapshotRecord};
use crate::model::BlockNode;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::remote::RemoteClient;
use crate::utils::errors::{EngineError, RemoteError};
use rewrite::{attachment_url, point_to_external, remap_ids};

/// Most children the remote accepts in one append.
pub const APPEND_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Parent the tree was rebuilt under
    pub root_id: String,
    /// Dump-time block id to newly created block id
    pub id_map: BTreeMap<String, String>,
    pub blocks_created: u64,
    /// Blocks patched after the walk to resolve forward references
    pub deferred_patched: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedBlock>,
}

/// A block the remote refused, with the subtree that was skipped with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBlock {
    pub block_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub error: String,
    pub skipped_descendants: usize,
}

/// A migration that stopped early; `report` holds everything created so far.
#[derive(Debug, Error)]
#[error("migration stopped after {} block(s): {error}", .report.blocks_created)]
pub struct MigrationAborted {
    pub report: MigrationReport,
    pub error: EngineError,
}

/// Outcome of one append, per submitted child.
type Created = Vec<Result<String, String>>;

pub struct MigrationEngine {
    client: Arc<dyn RemoteClient>,
}

struct Walk<'a> {
    manifest: &'a Manifest,
    static_base: &'a str,
    known: HashSet<String>,
    by_parent: HashMap<String, Vec<SnapshotRecord>>,
    deferred: Vec<SnapshotRecord>,
    report: MigrationReport,
}

impl Walk<'_> {
    /// The block submitted for `record`, and whether it still references a
    /// block that does not exist yet.
    fn prepare(&self, record: &SnapshotRecord) -> (BlockNode, bool) {
        let mut payload = record.payload.clone();
        if let Some(entry) = self.manifest.get(&record.id) {
            point_to_external(&mut payload, &attachment_url(self.static_base, &entry.path));
        }
        let unresolved = remap_ids(&mut payload, &self.known, &self.report.id_map);
        (BlockNode::new(record.kind.clone(), payload), unresolved)
    }

    fn descendants_of(&self, block_id: &str) -> usize {
        let mut count = 0;
        let mut stack = vec![block_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.by_parent.get(&id) {
                count += children.len();
                stack.extend(children.iter().map(|c| c.id.clone()));
            }
        }
        count
    }

    fn abort(self, error: EngineError) -> MigrationAborted {
        MigrationAborted {
            report: self.report,
            error,
        }
    }
}

impl MigrationEngine {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    /// Recreate the dumped tree under `target_page_id`.
    ///
    /// `static_base_url` is the public prefix of this dump's directory;
    /// attachments are re-linked to files beneath it. Created blocks are
    /// never rolled back.
    pub async fn migrate(
        &self,
        dump: &Dump,
        target_page_id: &str,
        static_base_url: &str,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<MigrationReport, MigrationAborted> {
        let started = Instant::now();
        let mut report = MigrationReport {
            root_id: target_page_id.to_string(),
            ..Default::default()
        };

        let loaded = async {
            dump.ensure_complete()?;
            let records = dump.records().await?;
            let manifest = dump.manifest().await?;
            Ok::<_, EngineError>((records, manifest))
        }
        .await;
        let (records, manifest) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => return Err(MigrationAborted { report, error }),
        };

        info!(
            "Migrating dump {} ({} blocks) under {}",
            dump.name(),
            records.len(),
            target_page_id
        );
        progress(ProgressEvent::Phase(format!(
            "Creating {} blocks",
            records.len()
        )));

        let known: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let mut by_parent: HashMap<String, Vec<SnapshotRecord>> = HashMap::new();
        for record in records {
            by_parent
                .entry(record.parent_id.clone())
                .or_default()
                .push(record);
        }
        report.id_map.insert(
            dump.meta.root_page_id.clone(),
            target_page_id.to_string(),
        );
        let mut walk = Walk {
            manifest: &manifest,
            static_base: static_base_url,
            known,
            by_parent,
            deferred: Vec::new(),
            report,
        };

        let mut queue = VecDeque::from([(
            dump.meta.root_page_id.clone(),
            target_page_id.to_string(),
        )]);

        while let Some((old_parent, new_parent)) = queue.pop_front() {
            let Some(children) = walk.by_parent.remove(&old_parent) else {
                continue;
            };

            for chunk in children.chunks(APPEND_LIMIT) {
                if cancel.is_cancelled() {
                    return Err(walk.abort(EngineError::Cancelled));
                }

                let prepared: Vec<(BlockNode, bool)> =
                    chunk.iter().map(|r| walk.prepare(r)).collect();
                let blocks: Vec<BlockNode> = prepared.iter().map(|(b, _)| b.clone()).collect();

                let created = match self.append_batch(&new_parent, &blocks, cancel).await {
                    Ok(created) => created,
                    Err(error) => return Err(walk.abort(error)),
                };

                let mut count = 0;
                for ((record, (_, unresolved)), outcome) in
                    chunk.iter().zip(prepared).zip(created)
                {
                    match outcome {
                        Ok(new_id) => {
                            count += 1;
                            walk.report.id_map.insert(record.id.clone(), new_id.clone());
                            if unresolved {
                                walk.deferred.push(record.clone());
                            }
                            if record.has_children {
                                queue.push_back((record.id.clone(), new_id));
                            }
                        }
                        Err(error) => {
                            let skipped = walk.descendants_of(&record.id);
                            warn!(
                                "Block {} ({}) rejected, skipping it and {} descendant(s): {}",
                                record.id, record.kind, skipped, error
                            );
                            walk.report.failed.push(FailedBlock {
                                block_id: record.id.clone(),
                                kind: record.kind.clone(),
                                error,
                                skipped_descendants: skipped,
                            });
                        }
                    }
                }

                walk.report.blocks_created += count as u64;
                progress(ProgressEvent::BlocksCreated {
                    parent_id: new_parent.clone(),
                    count,
                });
            }
        }

        if !walk.deferred.is_empty() {
            progress(ProgressEvent::Phase(format!(
                "Patching {} forward reference(s)",
                walk.deferred.len()
            )));
        }
        for record in std::mem::take(&mut walk.deferred) {
            if cancel.is_cancelled() {
                return Err(walk.abort(EngineError::Cancelled));
            }
            let Some(new_id) = walk.report.id_map.get(&record.id).cloned() else {
                continue;
            };
            let (block, still_unresolved) = walk.prepare(&record);
            if still_unresolved {
                debug!("Block {} references blocks that were not created", record.id);
            }
            match self.client.update_block(&new_id, &block).await {
                Ok(()) => walk.report.deferred_patched += 1,
                Err(RemoteError::InvalidRequest(error)) => {
                    warn!("Could not patch references of {}: {}", new_id, error);
                    walk.report.failed.push(FailedBlock {
                        block_id: record.id.clone(),
                        kind: record.kind.clone(),
                        error,
                        skipped_descendants: 0,
                    });
                }
                Err(e) => return Err(walk.abort(e.into())),
            }
        }

        let report = walk.report;
        if let Some(first) = report.failed.first() {
            let error = EngineError::PartialMigration {
                failed: report.failed.len(),
                first: first.error.clone(),
            };
            return Err(MigrationAborted { report, error });
        }

        info!(
            "Migration of {} complete: {} blocks created, {} patched in {:.1}s",
            dump.name(),
            report.blocks_created,
            report.deferred_patched,
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// Append one chunk. A rejected chunk is retried child by child so that
    /// a single unsupported block only costs itself.
    async fn append_batch(
        &self,
        parent_id: &str,
        blocks: &[BlockNode],
        cancel: &CancellationToken,
    ) -> Result<Created, EngineError> {
        match self.client.append_children(parent_id, blocks).await {
            Ok(ids) if ids.len() == blocks.len() => return Ok(ids.into_iter().map(Ok).collect()),
            Ok(ids) => {
                return Err(EngineError::Internal(format!(
                    "append under {parent_id} returned {} ids for {} blocks",
                    ids.len(),
                    blocks.len()
                )))
            }
            Err(RemoteError::InvalidRequest(reason)) if blocks.len() > 1 => {
                warn!(
                    "Batch of {} under {} rejected, appending one by one: {}",
                    blocks.len(),
                    parent_id,
                    reason
                );
            }
            Err(RemoteError::InvalidRequest(reason)) => return Ok(vec![Err(reason)]),
            Err(e) => return Err(e.into()),
        }

        let mut created = Vec::with_capacity(blocks.len());
        for block in blocks {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self
                .client
                .append_children(parent_id, std::slice::from_ref(block))
                .await
            {
                Ok(ids) => match ids.into_iter().next() {
                    Some(id) => created.push(Ok(id)),
                    None => created.push(Err("remote returned no id".to_string())),
                },
                Err(RemoteError::InvalidRequest(reason)) => created.push(Err(reason)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }
}
