//! The data-plane listener: answers PUT tar, GET tar, uploads, and
//! metadata snapshot requests from peers.
//!
//! One task per connection; the reactor owns all session state and
//! nothing outlives [`TransferServer::stop`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::*;

use crate::db::Tree;
use crate::errors::{Error, Result};
use crate::manifest::{Manifest, MetaSnapshot, MsgStat, PathList};
use crate::meta::{FileMeta, FileStatus, check_rel, join_rel};
use crate::notify::Event;
use crate::store::MetaStore;
use crate::transfer::{
    Applier, COPY_CHUNK, SessionState, StagingDir, TransferCtx, copy_exact, drain_exact, http,
    read_record, stat_consistent, tar, timed, timed_head, write_record, zero_fill,
};
use crate::{MANIFEST_NAME, file_util};

pub struct TransferServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TransferServer {
    /// Bind and start answering. `bind` is usually `0.0.0.0:<data_port>`.
    pub async fn start(ctx: Arc<TransferCtx>, bind: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::config(format!("couldn't bind data port {bind}: {e}")))?;
        let addr = listener.local_addr()?;
        info!("data plane listening on {addr}");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut sessions = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                trace!("session from {peer}");
                                let ctx = ctx.clone();
                                sessions.spawn(async move {
                                    if let Err(e) = handle_connection(ctx, stream).await {
                                        debug!("session from {peer} ended: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("accept failed: {e}");
                            }
                        }
                        // Reap finished sessions so the set stays small.
                        while sessions.try_join_next().is_some() {}
                    }
                }
            }
            // Sessions poll the abort flags cooperatively and their
            // staging dirs clean up on drop either way.
            sessions.shutdown().await;
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

async fn handle_connection(ctx: Arc<TransferCtx>, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(COPY_CHUNK, read_half);
    let mut writer = BufWriter::with_capacity(COPY_CHUNK, write_half);

    let mut state = SessionState::HeadRead;
    trace!("session starts ({state:?})");
    let head = match timed_head("head read", http::read_request_head(&mut reader)).await {
        Ok(head) => head,
        Err(e) => {
            state = SessionState::Error;
            let _ = http::write_response_head(&mut writer, &http::ResponseHead::error(400)).await;
            debug!("bad head ({state:?}): {e}");
            return Err(e);
        }
    };
    state = SessionState::BodyRead;
    trace!("{:?} for tree {} ({state:?})", head.method, head.remote_tree);

    let outcome = match head.method {
        http::Method::PutTar => handle_put(&ctx, &head, &mut reader).await,
        http::Method::Upload => handle_upload(&ctx, &head, &mut reader).await,
        http::Method::GetTar => handle_get(&ctx, &head, &mut reader, &mut writer).await,
        http::Method::GetMeta => handle_meta(&ctx, &head, &mut writer).await,
    };

    match outcome {
        Ok(responded) => {
            if !responded {
                state = SessionState::HeadWrite;
                trace!("responding ({state:?})");
                http::write_response_head(&mut writer, &http::ResponseHead::ok()).await?;
            }
            state = SessionState::Done;
            trace!("session over ({state:?})");
            Ok(())
        }
        Err(e) => {
            state = SessionState::Error;
            let code = match &e {
                Error::NotFound(_) | Error::Content(_) | Error::Config(_) => 400,
                Error::Permission(_) => 401,
                _ => 500,
            };
            let _ = http::write_response_head(&mut writer, &http::ResponseHead::error(code)).await;
            debug!("session over ({state:?}): {e}");
            Err(e)
        }
    }
}

/// A request must name one of our enabled trees.
fn resolve_tree(ctx: &TransferCtx, uuid: &str) -> Result<Tree> {
    let tree = ctx
        .db
        .tree(uuid)
        .map_err(|_| Error::not_found(format!("tree {uuid}")))?;
    if tree.device_uuid != ctx.self_device {
        return Err(Error::not_found(format!("tree {uuid} isn't local")));
    }
    if !tree.enabled {
        return Err(Error::permission(format!("tree {uuid} is disabled")));
    }
    Ok(tree)
}

/// Receive a PUT stream: manifest first, then data files into staging,
/// each hash-verified and atomically applied.
async fn handle_put<R>(ctx: &TransferCtx, head: &http::RequestHead, reader: &mut R) -> Result<bool>
where
    R: AsyncReadExt + Unpin,
{
    let tree = resolve_tree(ctx, &head.remote_tree)?;
    let sender_tree = head
        .local_tree
        .clone()
        .ok_or_else(|| Error::content("PUT without a sender tree"))?;

    // One data session per pair. A racing initiator on our side holds
    // this; the peer sees 500 and retries per the tie-break rule.
    let _pair = ctx
        .locks
        .try_lock(&tree.uuid, &sender_tree)
        .ok_or(Error::Again("tree pair is busy"))?;
    // Batch writers for the tree are serialized by its self-lock; an
    // index in flight means the peer comes back later.
    let _self_lock = ctx
        .locks
        .try_lock(&tree.uuid, &tree.uuid)
        .ok_or(Error::Again("tree is busy"))?;

    let staging = StagingDir::create(&tree.root)?;
    let mut applier = Applier::new(&ctx.db, &tree, &ctx.self_device)?;

    // Entry one: the manifest.
    let manifest: Manifest = {
        let header = next_file_entry(reader).await?.ok_or_else(|| {
            Error::content("PUT stream ended before the manifest")
        })?;
        if header.path != format!("/{MANIFEST_NAME}") {
            return Err(Error::content(format!(
                "first PUT entry was {}, not the manifest",
                header.path
            )));
        }
        const MANIFEST_LIMIT: u64 = 64 * 1024 * 1024;
        if header.size > MANIFEST_LIMIT {
            return Err(Error::content("manifest too large"));
        }
        let mut bytes = vec![0u8; header.size as usize];
        timed("manifest read", async {
            reader.read_exact(&mut bytes).await?;
            Ok(())
        })
        .await?;
        drain_exact(reader, tar::padding_for(header.size) as u64).await?;
        crate::manifest::decode(&bytes)?
    };

    let mut incoming: Vec<FileMeta> = Vec::with_capacity(manifest.stats.len());
    let mut by_path = rustc_hash::FxHashMap::default();
    for stat in manifest.stats {
        let row = stat.into_meta(&manifest.tree_uuids);
        if check_rel(&row.path).is_err() {
            warn!("peer sent illegal path {:?}; dropping", row.path);
            continue;
        }
        by_path.insert(row.path.clone(), row.clone());
        incoming.push(row);
    }
    applier.ingest_manifest_rows(incoming)?;

    // Then the data files.
    let mut entry_index = 0usize;
    loop {
        if ctx.abort.pair_aborted(&tree.uuid, &sender_tree) {
            return Err(Error::Cancelled);
        }
        let Some(header) = next_file_entry(reader).await? else {
            break;
        };
        let Some(expected) = by_path.get(&header.path).cloned() else {
            debug!("PUT body entry {} missing from manifest", header.path);
            drain_exact(reader, header.size + tar::padding_for(header.size) as u64).await?;
            continue;
        };
        if !expected.is_regular() || expected.status != FileStatus::Normal {
            drain_exact(reader, header.size + tar::padding_for(header.size) as u64).await?;
            continue;
        }

        let staged_path = staging.entry(entry_index);
        entry_index += 1;
        let mut staged = tokio::fs::File::create(&staged_path).await?;
        let got_hash = copy_exact(reader, &mut staged, header.size, &ctx.down_limit, |_| {
            if ctx.abort.pair_aborted(&tree.uuid, &sender_tree) {
                return Err(Error::Cancelled);
            }
            Ok(())
        })
        .await?;
        staged.sync_all().await?;
        drop(staged);
        drain_exact(reader, tar::padding_for(header.size) as u64).await?;

        let hash_ok =
            expected.sha1.is_some_and(|want| want == got_hash) && header.size == expected.length.max(0) as u64;
        if !hash_ok {
            info!("{} arrived corrupt or stale; deferring", header.path);
            let _ = std::fs::remove_file(&staged_path);
            continue;
        }
        applier.apply_data(expected, &staged_path)?;
    }
    applier.flush()?;

    if applier.applied > 0 {
        ctx.notifier.emit(Event::SyncModify);
    }
    Ok(false)
}

/// Receive an upload: files go straight into the tree with no incoming
/// metadata; the next index pass mints their rows.
async fn handle_upload<R>(
    ctx: &TransferCtx,
    head: &http::RequestHead,
    reader: &mut R,
) -> Result<bool>
where
    R: AsyncReadExt + Unpin,
{
    let tree = resolve_tree(ctx, &head.remote_tree)?;
    let staging = StagingDir::create(&tree.root)?;

    let mut n = 0usize;
    loop {
        if ctx.abort.tree_aborted(&tree.uuid) {
            return Err(Error::Cancelled);
        }
        let Some(header) = next_file_entry(reader).await? else {
            break;
        };
        if check_rel(&header.path).is_err() {
            warn!("upload with illegal path {:?}; dropping", header.path);
            drain_exact(reader, header.size + tar::padding_for(header.size) as u64).await?;
            continue;
        }
        if header.kind == tar::EntryKind::Directory {
            std::fs::create_dir_all(join_rel(&tree.root, &header.path))?;
            drain_exact(reader, header.size + tar::padding_for(header.size) as u64).await?;
            continue;
        }

        let staged_path = staging.entry(n);
        n += 1;
        let mut staged = tokio::fs::File::create(&staged_path).await?;
        copy_exact(reader, &mut staged, header.size, &ctx.down_limit, |_| {
            if ctx.abort.tree_aborted(&tree.uuid) {
                return Err(Error::Cancelled);
            }
            Ok(())
        })
        .await?;
        staged.sync_all().await?;
        drop(staged);
        drain_exact(reader, tar::padding_for(header.size) as u64).await?;

        file_util::place_file(&staged_path, &join_rel(&tree.root, &header.path))?;
    }
    Ok(false)
}

/// Stream requested files back. Paths that vanished or drifted since
/// their last index are silently left out; the requester defers them.
async fn handle_get<R, W>(
    ctx: &TransferCtx,
    head: &http::RequestHead,
    reader: &mut R,
    writer: &mut W,
) -> Result<bool>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let tree = resolve_tree(ctx, &head.remote_tree)?;
    let request: PathList = read_record(reader).await?;

    let store = MetaStore::open(ctx.db.path(), &tree.uuid)?;
    let mut sendable = Vec::new();
    let mut total_size = 0u64;
    for path in request.paths {
        if check_rel(&path).is_err() {
            continue;
        }
        let Some(row) = store.get(&path)? else {
            debug!("peer asked for {path}, which we don't have");
            continue;
        };
        if !row.is_regular() || row.status != FileStatus::Normal {
            continue;
        }
        let abs = join_rel(&tree.root, &path);
        if !stat_consistent(&abs, &row) {
            info!("{path} drifted since its index; not sending");
            continue;
        }
        let header = tar::EntryHeader {
            path: path.clone(),
            size: row.length.max(0) as u64,
            kind: tar::EntryKind::Regular,
            mtime_secs: row.mtime_ms / 1000,
        };
        total_size +=
            tar::encode_entry(&header).len() as u64 + header.size + tar::padding_for(header.size) as u64;
        sendable.push((abs, header));
    }
    total_size += tar::end_of_stream().len() as u64;

    http::write_response_head(
        writer,
        &http::ResponseHead {
            code: 200,
            total_size,
            total_files: sendable.len() as u32,
        },
    )
    .await?;

    for (abs, header) in sendable {
        if ctx.abort.tree_aborted(&tree.uuid) {
            return Err(Error::Cancelled);
        }
        timed("entry header write", async {
            writer.write_all(&tar::encode_entry(&header)).await?;
            Ok(())
        })
        .await?;
        match tokio::fs::File::open(&abs).await {
            Ok(mut fh) => {
                let mut sent = 0u64;
                let mut buf = vec![0u8; COPY_CHUNK];
                let mut failed = false;
                while sent < header.size {
                    let want = ((header.size - sent) as usize).min(buf.len());
                    ctx.up_limit.throttle(want).await;
                    match fh.read(&mut buf[..want]).await {
                        Ok(0) => {
                            failed = true;
                            break;
                        }
                        Ok(n) => {
                            timed("body write", async {
                                writer.write_all(&buf[..n]).await?;
                                Ok(())
                            })
                            .await?;
                            sent += n as u64;
                        }
                        Err(e) => {
                            warn!("reading {abs} failed mid-send: {e}");
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    zero_fill(writer, &ctx.up_limit, header.size - sent).await?;
                }
            }
            Err(e) => {
                warn!("couldn't open {abs}: {e}; sending zeros");
                zero_fill(writer, &ctx.up_limit, header.size).await?;
            }
        }
        timed("entry padding write", async {
            writer
                .write_all(&vec![0u8; tar::padding_for(header.size)])
                .await?;
            Ok(())
        })
        .await?;
    }
    timed("stream end write", async {
        writer.write_all(&tar::end_of_stream()).await?;
        writer.flush().await?;
        Ok(())
    })
    .await?;
    Ok(true)
}

/// Serve the metadata snapshot the remote planner walks against.
async fn handle_meta<W>(ctx: &TransferCtx, head: &http::RequestHead, writer: &mut W) -> Result<bool>
where
    W: AsyncWriteExt + Unpin,
{
    let tree = resolve_tree(ctx, &head.remote_tree)?;
    let store = MetaStore::open(ctx.db.path(), &tree.uuid)?;
    let tree_uuids = ctx.db.sync_tree_uuids(&tree.sync_uuid)?;

    let stats: Vec<MsgStat> = store
        .scan_all()?
        .iter()
        .map(|row| MsgStat::from_meta(row, &tree_uuids))
        .collect();
    let snapshot = MetaSnapshot {
        tree_uuid: tree.uuid.clone(),
        tree_uuids,
        synclist: ctx.db.synclist(&tree.uuid)?.entries(),
        stats,
    };

    http::write_response_head(writer, &http::ResponseHead::ok()).await?;
    write_record(writer, &snapshot).await?;
    timed("response flush", async {
        writer.flush().await?;
        Ok(())
    })
    .await?;
    Ok(true)
}

/// Read header blocks until a real file/directory entry or end of stream.
async fn next_file_entry<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<tar::EntryHeader>> {
    let mut decoder = tar::HeaderDecoder::new();
    loop {
        let mut block = [0u8; tar::BLOCK_SIZE];
        timed("entry header read", async {
            reader.read_exact(&mut block).await?;
            Ok(())
        })
        .await?;
        match decoder.decode_block(&block)? {
            tar::Decoded::End => return Ok(None),
            tar::Decoded::NeedLongName(size) => {
                let mut payload = vec![0u8; size as usize];
                timed("long name read", async {
                    reader.read_exact(&mut payload).await?;
                    Ok(())
                })
                .await?;
                drain_exact(reader, tar::padding_for(size) as u64).await?;
                decoder.feed_long_name(&payload);
            }
            tar::Decoded::Entry(header) => return Ok(Some(header)),
        }
    }
}
