//! Chunked transfer of files and directories between two devices.
//!
//! Both variants run the same receiver state machine (`apply_chunk`):
//! chunks are written in place at `index * CHUNK_SIZE` into a staging file
//! under the state directory, and on the final chunk the receiver truncates
//! to the advertised size, hashes what it has, and either finishes or wipes
//! the staging file and asks for chunk 0 again. Only verified content is
//! moved over the target, so a session that fails halfway leaves the
//! target as it was. The receiver always names the next index, so only one
//! side ever advances a session.
//!
//! - Demand: the receiver asks for each chunk (`fetch_path`).
//! - Push: the sender offers each chunk and follows the receiver's answer
//!   (`push_path`).

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::device::DeviceContext;
use crate::events::{EventKind, FolderEvent};
use crate::retry::RestartBudget;
use peersync_common::{Error, FolderPath, PeerRef, Result};
use peersync_net::{Chunk, Exchange, ExchangeId, Message, CHUNK_DONE};
use peersync_storage::{content_hash, ContentHash, CHUNK_SIZE, STATE_DIR_NAME};

const CHUNK_LEN: u64 = CHUNK_SIZE as u64;

/// Staging area for incoming files, inside the state directory.
const PARTIAL_DIR: &str = "partial";

/// Number of chunks a file of `size` bytes is sent in. Empty files still
/// take one (empty) chunk.
pub fn total_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_LEN).max(1)
}

/// Where the file received through `exchange` is assembled.
pub(crate) fn staging_path(exchange: ExchangeId) -> Result<FolderPath> {
    FolderPath::root()
        .join(STATE_DIR_NAME)?
        .join(PARTIAL_DIR)?
        .join(&exchange.to_string())
}

fn check_synced_path(path: &FolderPath) -> Result<()> {
    if path.components().first().map(String::as_str) == Some(STATE_DIR_NAME) {
        return Err(Error::Protocol(format!("{} is not part of the folder", path)));
    }
    Ok(())
}

/// Drop a staging file after a failed or abandoned session.
pub(crate) async fn discard_staging(ctx: &DeviceContext, staging: &FolderPath) {
    match ctx.provider.exists(staging).await {
        Ok(true) => {
            if let Err(e) = ctx.provider.delete(staging).await {
                warn!("Could not remove partial file {}: {}", staging, e);
            }
        }
        Ok(false) => {}
        Err(e) => debug!("Could not check partial file {}: {}", staging, e),
    }
}

/// Move a verified staging file over `path`.
pub(crate) async fn install(ctx: &DeviceContext, staging: &FolderPath, path: &FolderPath) -> Result<()> {
    let provider = ctx.provider.as_ref();
    if provider.exists(path).await? {
        provider.delete(path).await?;
    }
    provider.rename(staging, path).await?;
    Ok(())
}

/// Outcome of a finished transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub path: FolderPath,
    /// Size of the verified content.
    pub bytes: u64,
    /// Chunk steps exchanged, restarts included.
    pub chunks: u64,
    pub restarts: u32,
    pub hash: ContentHash,
}

/// Build chunk `index` of `path` as it is on disk right now.
///
/// Indices past the end of the file yield an empty payload. The final chunk
/// carries the checksum of the file at the moment it is read, so a file that
/// changes mid-transfer fails verification rather than arriving torn.
pub async fn read_chunk(ctx: &DeviceContext, path: &FolderPath, index: u64) -> Result<Chunk> {
    check_synced_path(path)?;
    let metadata = ctx.provider.metadata(path).await?;
    if metadata.is_directory {
        return Ok(Chunk {
            path: path.clone(),
            is_file: false,
            chunk_index: 0,
            chunk_size: CHUNK_LEN,
            total_chunks: 0,
            total_size: 0,
            payload: Vec::new(),
            checksum: Some(ContentHash::directory()),
        });
    }

    let total_size = metadata.size.unwrap_or(0);
    let payload = ctx
        .provider
        .read_chunk(path, index.saturating_mul(CHUNK_LEN), CHUNK_SIZE)
        .await?;

    let mut chunk = Chunk {
        path: path.clone(),
        is_file: true,
        chunk_index: index,
        chunk_size: CHUNK_LEN,
        total_chunks: total_chunks(total_size),
        total_size,
        payload,
        checksum: None,
    };
    if chunk.is_final() {
        chunk.checksum = Some(content_hash(ctx.provider.as_ref(), path).await?);
    }
    Ok(chunk)
}

/// What the receiver wants after applying a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStep {
    /// Send this chunk index next.
    Next(u64),
    /// Content verified; the session is over.
    Verified(ContentHash),
    /// Verification failed and the staging file was wiped; start over at 0.
    Restart,
}

/// Receiver side: write one chunk into `staging` and decide what comes next.
///
/// Directories are created at their real path straight away. A verified
/// file is left in `staging` for the caller to `install`. Applying the same
/// chunk twice leaves the same bytes behind.
pub async fn apply_chunk(ctx: &DeviceContext, chunk: &Chunk, staging: &FolderPath) -> Result<ChunkStep> {
    if chunk.chunk_size != CHUNK_LEN {
        return Err(Error::Protocol(format!(
            "Chunk size {} for {} (expected {})",
            chunk.chunk_size, chunk.path, CHUNK_LEN
        )));
    }
    check_synced_path(&chunk.path)?;

    let provider = ctx.provider.as_ref();
    let path = &chunk.path;

    if !chunk.is_file {
        if provider.exists(path).await? && !provider.metadata(path).await?.is_directory {
            provider.delete(path).await?;
        }
        provider.create_dir(path).await?;
        debug!("{} created directory {}", ctx.local.device, path);
        return Ok(ChunkStep::Verified(ContentHash::directory()));
    }

    provider
        .write_chunk(staging, chunk.chunk_index.saturating_mul(CHUNK_LEN), &chunk.payload)
        .await?;
    debug!(
        "{} wrote chunk {}/{} of {} ({} bytes)",
        ctx.local.device,
        chunk.chunk_index + 1,
        chunk.total_chunks,
        path,
        chunk.payload.len()
    );

    if !chunk.is_final() {
        return Ok(ChunkStep::Next(chunk.chunk_index + 1));
    }

    provider.truncate(staging, chunk.total_size).await?;
    let actual = content_hash(provider, staging).await?;
    match &chunk.checksum {
        Some(expected) if *expected != actual => {
            warn!(
                "Checksum mismatch on {} (expected {}, got {}), restarting",
                path,
                expected.short(),
                actual.short()
            );
            provider.truncate(staging, 0).await?;
            Ok(ChunkStep::Restart)
        }
        _ => Ok(ChunkStep::Verified(actual)),
    }
}

/// Record a verified transfer and tell the local event pipeline about it.
pub(crate) async fn finish_transfer(
    ctx: &DeviceContext,
    path: &FolderPath,
    hash: &ContentHash,
    existed: bool,
) -> Result<u64> {
    let (size, is_directory) = if hash.is_directory() {
        (0, true)
    } else {
        (ctx.provider.metadata(path).await?.size.unwrap_or(0), false)
    };

    ctx.store.write().await.record_local_change(
        path,
        hash.clone(),
        (!is_directory).then_some(size),
    );

    let kind = if existed {
        EventKind::Modified
    } else {
        EventKind::Created
    };
    ctx.events
        .notify(FolderEvent::new(path.clone(), kind, is_directory).suppressed());
    Ok(size)
}

/// Demand variant: pull `path` from `source` chunk by chunk.
///
/// On failure nothing at `path` has changed.
///
/// # Errors
/// - `Timeout` if the source stops answering or the session deadline passes
/// - `Protocol` if the source refuses or answers out of turn
/// - `Checksum` if verification keeps failing until the restart budget is spent
/// - Local I/O errors, without retry
pub async fn fetch_path(
    ctx: &DeviceContext,
    source: &PeerRef,
    path: &FolderPath,
) -> Result<TransferReport> {
    let mut exchange = ctx.coordinator.open();
    let staging = staging_path(exchange.id())?;

    let result = demand_chunks(ctx, source, path, &staging, &mut exchange).await;
    if result.is_err() {
        discard_staging(ctx, &staging).await;
    }
    result
}

async fn demand_chunks(
    ctx: &DeviceContext,
    source: &PeerRef,
    path: &FolderPath,
    staging: &FolderPath,
    exchange: &mut Exchange,
) -> Result<TransferReport> {
    let existed = ctx.provider.exists(path).await?;
    let targets = [source.address.clone()];
    let mut budget = RestartBudget::new(
        ctx.config.restart.clone(),
        ctx.config.transfer_session_timeout,
    );

    let mut index = 0u64;
    let mut chunks = 0u64;
    let mut restarts = 0u32;

    loop {
        if budget.expired() {
            return Err(Error::Timeout(format!(
                "Transfer of {} from {} exceeded its session deadline",
                path, source
            )));
        }

        exchange.send_request(
            &targets,
            Message::ChunkDemandRequest {
                path: path.clone(),
                chunk_index: index,
            },
        )?;
        let outcome = exchange.wait(ctx.config.chunk_timeout).await?;
        let response = outcome.responses.into_iter().next().ok_or_else(|| {
            Error::Timeout(format!("{} did not send chunk {} of {}", source, index, path))
        })?;

        let chunk = match response.body {
            Message::ChunkDemandResponse(chunk) => chunk,
            Message::Refused { reason } => {
                return Err(Error::Protocol(format!(
                    "{} refused chunk {} of {}: {}",
                    source, index, path, reason
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected {} while fetching {}",
                    other.kind(),
                    path
                )));
            }
        };
        if chunk.path != *path || (chunk.is_file && chunk.chunk_index != index) {
            return Err(Error::Protocol(format!(
                "Asked for chunk {} of {}, got chunk {} of {}",
                index, path, chunk.chunk_index, chunk.path
            )));
        }
        chunks += 1;

        match apply_chunk(ctx, &chunk, staging).await? {
            ChunkStep::Next(next) => index = next,
            ChunkStep::Verified(hash) => {
                if !hash.is_directory() {
                    install(ctx, staging, path).await?;
                }
                let bytes = finish_transfer(ctx, path, &hash, existed).await?;
                info!(
                    "Fetched {} from {} ({} bytes, {} chunk(s), {} restart(s))",
                    path, source.device, bytes, chunks, restarts
                );
                return Ok(TransferReport {
                    path: path.clone(),
                    bytes,
                    chunks,
                    restarts,
                    hash,
                });
            }
            ChunkStep::Restart => match budget.next_delay() {
                Some(delay) => {
                    restarts += 1;
                    tokio::time::sleep(delay).await;
                    index = 0;
                }
                None => {
                    return Err(Error::Checksum(format!(
                        "{} from {} never verified after {} restart(s)",
                        path, source, restarts
                    )));
                }
            },
        }
    }
}

/// Push variant: send `path` to `target`, one chunk per acknowledgement.
///
/// # Errors
/// Same as `fetch_path`.
pub async fn push_path(
    ctx: &DeviceContext,
    path: &FolderPath,
    target: &PeerRef,
) -> Result<TransferReport> {
    let targets = [target.address.clone()];
    let mut exchange = ctx.coordinator.open();
    let mut budget = RestartBudget::new(
        ctx.config.restart.clone(),
        ctx.config.transfer_session_timeout,
    );

    let mut index = 0u64;
    let mut chunks = 0u64;
    let mut restarts = 0u32;

    loop {
        if budget.expired() {
            return Err(Error::Timeout(format!(
                "Push of {} to {} exceeded its session deadline",
                path, target
            )));
        }

        let chunk = read_chunk(ctx, path, index).await?;
        let was_final = chunk.is_final();
        let checksum = chunk.checksum.clone();
        let size = chunk.total_size;

        exchange.send_request(&targets, Message::ChunkPushRequest(chunk))?;
        let outcome = exchange.wait(ctx.config.chunk_timeout).await?;
        let response = outcome.responses.into_iter().next().ok_or_else(|| {
            Error::Timeout(format!("{} did not acknowledge chunk {} of {}", target, index, path))
        })?;
        chunks += 1;

        let next = match response.body {
            Message::ChunkPushResponse { next_chunk } => next_chunk,
            Message::Refused { reason } => {
                return Err(Error::Protocol(format!(
                    "{} refused chunk {} of {}: {}",
                    target, index, path, reason
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected {} while pushing {}",
                    other.kind(),
                    path
                )));
            }
        };

        if next == CHUNK_DONE {
            let hash = checksum.ok_or_else(|| {
                Error::Protocol(format!("{} accepted {} before its final chunk", target, path))
            })?;
            info!(
                "Pushed {} to {} ({} bytes, {} chunk(s), {} restart(s))",
                path, target.device, size, chunks, restarts
            );
            return Ok(TransferReport {
                path: path.clone(),
                bytes: size,
                chunks,
                restarts,
                hash,
            });
        }
        let next = u64::try_from(next).map_err(|_| {
            Error::Protocol(format!("{} asked for chunk {} of {}", target, next, path))
        })?;

        if was_final {
            match budget.next_delay() {
                Some(delay) => {
                    restarts += 1;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(Error::Checksum(format!(
                        "{} at {} never verified after {} restart(s)",
                        path, target, restarts
                    )));
                }
            }
        }
        index = next;
    }
}

/// Push `path` to several peers at once.
pub async fn push_to_peers(
    ctx: &DeviceContext,
    path: &FolderPath,
    targets: &[PeerRef],
) -> Vec<(PeerRef, Result<TransferReport>)> {
    let pushes = targets.iter().map(|target| async move {
        let result = push_path(ctx, path, target).await;
        if let Err(e) = &result {
            warn!("Push of {} to {} failed: {}", path, target, e);
        }
        (target.clone(), result)
    });
    join_all(pushes).await
}
