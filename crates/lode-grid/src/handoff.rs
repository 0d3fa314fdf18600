//! Bucket hand-off between members.
//!
//! Seeding copies a bucket from its primary to an owner that just gained
//! it. The primary walks its store in key order, a chunk at a time, and
//! only moves its cursor once the target acknowledged a chunk. A lost
//! chunk or ack is re-sent from the last acknowledged key; an aborted
//! transfer restarted later resumes from the same place. Writes keep
//! flowing during the copy, because the target is already a secondary and
//! receives them through normal replication.
//!
//! Moving a primary additionally freezes the old primary and fences the
//! link to the new one, so the new primary provably holds every write
//! the old one accepted before ownership flips.

use std::sync::Arc;

use lode_cluster::{
    BucketSnapshotChunk, GridError, HandoffError, HandoffKey, MemberId, RegionId, Request,
    Response, VersionStamp,
};
use lode_core::{BucketRequest, BucketResponse, Chunk, HandoffCursor};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::node::{unexpected, NodeInner};

/// Starts seeding `key.target` with the local copy of `key.bucket`.
pub(crate) fn spawn_seed(node: &Arc<NodeInner>, key: HandoffKey) {
    let node = Arc::clone(node);
    tokio::spawn(async move {
        if let Err(e) = seed(&node, key.clone()).await {
            warn!(%key, "hand-off failed: {e}");
        }
    });
}

async fn seed(node: &Arc<NodeInner>, key: HandoffKey) -> Result<(), GridError> {
    let epoch = current_epoch(node, &key)?;
    let resume = {
        let mut handoffs = node.handoffs.lock().await;
        match handoffs.start(key.clone(), epoch) {
            Ok(handoff) => handoff.resume_after.clone(),
            Err(HandoffError::AlreadyInProgress(_)) => {
                debug!(%key, "hand-off already streaming");
                return Ok(());
            }
            Err(e) => return Err(GridError::Unavailable(e.to_string())),
        }
    };
    match &resume {
        Some(_) => info!(%key, epoch, "hand-off resumed"),
        None => info!(%key, epoch, "hand-off started"),
    }

    let result = stream(node, &key, resume).await;
    let mut handoffs = node.handoffs.lock().await;
    match result {
        Ok(epoch) => {
            let sent = handoffs.complete(&key).map(|h| h.entries_sent).unwrap_or(0);
            drop(handoffs);
            info!(%key, entries = sent, "hand-off complete");
            counter!("lode_handoffs_completed_total").increment(1);
            node.report_seeded(key, epoch);
            Ok(())
        }
        Err(e) => {
            handoffs.abort(&key);
            counter!("lode_handoffs_aborted_total").increment(1);
            Err(e)
        }
    }
}

/// Epoch the bucket holds in the local table, as long as this member is
/// still its primary and the target still one of its owners.
fn current_epoch(node: &NodeInner, key: &HandoffKey) -> Result<u64, GridError> {
    let not_primary = || GridError::not_owner(&key.region.name, key.bucket, node.id);
    let entry = node
        .directory
        .entry(&key.region.name)
        .filter(|e| e.id == key.region)
        .ok_or_else(not_primary)?;
    let ownership = entry.table.bucket(key.bucket).ok_or_else(not_primary)?;
    if ownership.primary != Some(node.id) {
        return Err(not_primary());
    }
    if !ownership.is_owner(key.target) {
        return Err(GridError::Unavailable(format!(
            "{} no longer owns the bucket",
            key.target
        )));
    }
    Ok(ownership.epoch)
}

/// Streams chunks until the target acknowledged the last one. Returns the
/// epoch the final chunk was sent under.
async fn stream(node: &Arc<NodeInner>, key: &HandoffKey, resume: Option<bytes::Bytes>) -> Result<u64, GridError> {
    let limit = node.config.rebalance.handoff_chunk_entries;
    let timeout = node.config.rebalance.chunk_timeout();
    let max_retries = node.config.rebalance.max_chunk_retries;
    let mut cursor = HandoffCursor::resume_after(resume);

    loop {
        // the table can move on mid-transfer; always ship under the
        // newest epoch so the target does not reject the chunk
        let epoch = current_epoch(node, key)?;
        let chunk = read_chunk(node, key, &cursor, limit).await?;
        let addr = node
            .view()
            .addr_of(key.target)
            .ok_or_else(|| GridError::Unavailable(format!("{} left the view", key.target)))?;
        let request = Request::SnapshotChunk(BucketSnapshotChunk {
            region: key.region.clone(),
            bucket: key.bucket,
            epoch,
            entries: chunk.entries.clone(),
            last: chunk.last,
        });

        match node.call_with(addr, request, timeout).await {
            Ok(Response::ChunkAck(Ok(_))) => {
                node.handoffs
                    .lock()
                    .await
                    .record_ack(key, chunk.entries.len(), chunk.last_key())
                    .map_err(|e| GridError::Unavailable(e.to_string()))?;
                counter!("lode_handoff_chunks_total").increment(1);
                cursor.advance(&chunk);
                if chunk.last {
                    return Ok(epoch);
                }
            }
            Ok(Response::ChunkAck(Err(e))) => return Err(e),
            Ok(other) => return Err(unexpected(&other)),
            Err(e) => {
                let retries = node
                    .handoffs
                    .lock()
                    .await
                    .record_retry(key)
                    .map_err(|e| GridError::Unavailable(e.to_string()))?;
                if retries > max_retries {
                    return Err(GridError::Timeout);
                }
                debug!(%key, retries, "chunk not acknowledged ({e}), re-sending");
            }
        }
    }
}

async fn read_chunk(
    node: &NodeInner,
    key: &HandoffKey,
    cursor: &HandoffCursor,
    limit: usize,
) -> Result<Chunk, GridError> {
    let handle = node
        .bucket(&key.region, key.bucket)
        .ok_or_else(|| GridError::not_owner(&key.region.name, key.bucket, node.id))?;
    let request = BucketRequest::Chunk {
        after: cursor.position().cloned(),
        limit,
    };
    match handle.send(request).await? {
        BucketResponse::Chunk(chunk) => Ok(chunk),
        BucketResponse::Err(e) => Err(e),
        _ => Err(GridError::Unavailable("unexpected bucket response".into())),
    }
}

/// Prepares the local primary of `region`/`bucket` to hand its role to
/// `target`.
///
/// Freezes the bucket at `epoch`, so no new write is accepted, then sends
/// the target an empty final chunk. Replicated writes and chunks travel
/// the same ordered link, so once the target acknowledges the fence it has
/// applied every write the primary accepted. Returns the newest stamp the
/// primary held.
pub(crate) async fn finalize(
    node: &Arc<NodeInner>,
    region: &RegionId,
    bucket: u32,
    epoch: u64,
    target: MemberId,
) -> Result<VersionStamp, GridError> {
    let key = HandoffKey {
        region: region.clone(),
        bucket,
        target,
    };
    if node.handoffs.lock().await.get(&key).is_some() {
        return Err(GridError::Unavailable(format!("{key} is still being seeded")));
    }
    let handle = node
        .bucket(region, bucket)
        .ok_or_else(|| GridError::not_owner(&region.name, bucket, node.id))?;
    let high_water = match handle.send(BucketRequest::Freeze { epoch }).await? {
        BucketResponse::Frozen(stamp) => stamp,
        BucketResponse::Err(e) => return Err(e),
        _ => return Err(GridError::Unavailable("unexpected bucket response".into())),
    };
    debug!(region = %region, bucket, %target, %high_water, "primary frozen for hand-off");

    let addr = node
        .view()
        .addr_of(target)
        .ok_or_else(|| GridError::Unavailable(format!("{target} left the view")))?;
    let fence = Request::SnapshotChunk(BucketSnapshotChunk {
        region: region.clone(),
        bucket,
        epoch,
        entries: Vec::new(),
        last: true,
    });
    match node
        .call_with(addr, fence, node.config.rebalance.chunk_timeout())
        .await?
    {
        Response::ChunkAck(Ok(_)) => Ok(high_water),
        Response::ChunkAck(Err(e)) => Err(e),
        other => Err(unexpected(&other)),
    }
}
