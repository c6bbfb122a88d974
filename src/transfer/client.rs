//! Outbound transfer sessions: PUSH (PUT tar), PULL (GET tar), pure
//! uploads, and the metadata snapshot fetch that feeds the planner.

use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::*;

use crate::db::Tree;
use crate::errors::{Error, Result};
use crate::hashing::ContentHash;
use crate::manifest::{self, Manifest, MetaSnapshot, MsgStat, PathList};
use crate::meta::{FileMeta, join_rel};
use crate::monitor::TransferKind;
use crate::planner::{SyncFile, SyncPlan};
use crate::transfer::{
    Applier, CONNECT_TIMEOUT, COPY_CHUNK, StagingDir, TransferCtx, copy_exact, drain_exact, http,
    limiter::RateLimiter, read_record, stat_consistent, tar, timed, timed_head, write_record,
    zero_fill,
};
use crate::MANIFEST_NAME;

/// The on-disk manifest only lives for its session.
struct RemoveOnDrop(Utf8PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn connect(addr: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::network(format!("connecting to {addr} timed out")))?
        .map_err(|e| Error::network(format!("couldn't connect to {addr}: {e}")))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Fetch the remote tree's current table and whitelist.
pub async fn fetch_meta(addr: &str, local_tree: &str, remote_tree: &str) -> Result<MetaSnapshot> {
    let stream = connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    timed("head write", async {
        http::write_request_head(
            &mut writer,
            &http::RequestHead {
                method: http::Method::GetMeta,
                remote_tree: remote_tree.to_owned(),
                local_tree: Some(local_tree.to_owned()),
                total_size: 0,
                total_files: 0,
            },
        )
        .await?;
        writer.flush().await?;
        Ok(())
    })
    .await?;

    let response = timed_head("head read", http::read_response_head(&mut reader)).await?;
    if response.code != 200 {
        return Err(http::status_error(response.code));
    }
    read_record(&mut reader).await
}

/// Execute the push half of a plan: manifest first, then every data file
/// that still matches its row. Files that drifted or fail to read are
/// skipped and the session continues.
pub async fn push(
    ctx: &TransferCtx,
    addr: &str,
    tree_uuids: &[String],
    local_tree: &Tree,
    remote_tree: &str,
    plan: &SyncPlan,
) -> Result<()> {
    // Manifest order mirrors receiver execution order: tombstones
    // children-first, then creations, then the data stats.
    let mut stats: Vec<MsgStat> = Vec::new();
    for action in &plan.push_remove_metas {
        stats.push(MsgStat::from_meta(&action.src, tree_uuids));
    }
    for pair in &plan.push_renames {
        stats.push(MsgStat::from_meta(&pair.from.src, tree_uuids));
        stats.push(MsgStat::from_meta(&pair.to.src, tree_uuids));
    }
    for action in &plan.push_make_metas {
        stats.push(MsgStat::from_meta(&action.src, tree_uuids));
    }
    for action in &plan.push_datas {
        stats.push(MsgStat::from_meta(&action.src, tree_uuids));
    }
    if stats.is_empty() {
        return Ok(());
    }

    let record = Manifest {
        sender_tree: local_tree.uuid.clone(),
        receiver_tree: remote_tree.to_owned(),
        tree_uuids: tree_uuids.to_vec(),
        stats,
    };
    let manifest_bytes = manifest::encode(&record)?;

    // The manifest transits as a regular file at the well-known name; it
    // also lands beside the tree root for the session's duration.
    let manifest_path = local_tree.root.join(MANIFEST_NAME);
    std::fs::write(&manifest_path, &manifest_bytes)?;
    crate::file_util::hide_best_effort(&manifest_path);
    let _cleanup = RemoveOnDrop(manifest_path);

    let total_bytes: i64 = plan.push_datas.iter().map(|a| a.src.length).sum();
    let task = ctx.monitor.start_task(
        TransferKind::Put,
        &local_tree.uuid,
        remote_tree,
        plan.push_datas.len() as u32,
        total_bytes,
    );

    let stream = connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::with_capacity(COPY_CHUNK, write_half);

    timed("head write", async {
        http::write_request_head(
            &mut writer,
            &http::RequestHead {
                method: http::Method::PutTar,
                remote_tree: remote_tree.to_owned(),
                local_tree: Some(local_tree.uuid.clone()),
                total_size: manifest_bytes.len() as u64 + total_bytes.max(0) as u64,
                total_files: plan.push_datas.len() as u32 + 1,
            },
        )
        .await
    })
    .await?;

    // Entry one: the manifest.
    let manifest_header = tar::EntryHeader {
        path: format!("/{MANIFEST_NAME}"),
        size: manifest_bytes.len() as u64,
        kind: tar::EntryKind::Regular,
        mtime_secs: 0,
    };
    timed("manifest write", async {
        writer.write_all(&tar::encode_entry(&manifest_header)).await?;
        writer.write_all(&manifest_bytes).await?;
        writer
            .write_all(&vec![0u8; tar::padding_for(manifest_bytes.len() as u64)])
            .await?;
        Ok(())
    })
    .await?;

    for action in &plan.push_datas {
        if ctx.abort.pair_aborted(&local_tree.uuid, remote_tree) {
            return Err(Error::Cancelled);
        }
        let row = &action.src;
        let abs = join_rel(&local_tree.root, &row.path);

        // The disk may have moved on since the plan snapshot; a drifted
        // file would hash wrong on the peer anyway, so don't bother.
        if !stat_consistent(&abs, row) {
            info!("{} changed since planning; skipping", row.path);
            task.on_file_skipped(1);
            task.on_byte_skipped(row.length.max(0) as u64);
            continue;
        }
        let mut fh = match tokio::fs::File::open(&abs).await {
            Ok(fh) => fh,
            Err(e) => {
                info!("couldn't open {}: {e}; skipping", row.path);
                task.on_file_skipped(1);
                task.on_byte_skipped(row.length.max(0) as u64);
                continue;
            }
        };

        task.on_file_transfer(&row.path);
        let header = tar::EntryHeader {
            path: row.path.clone(),
            size: row.length.max(0) as u64,
            kind: tar::EntryKind::Regular,
            mtime_secs: row.mtime_ms / 1000,
        };
        timed("entry header write", async {
            writer.write_all(&tar::encode_entry(&header)).await?;
            Ok(())
        })
        .await?;

        // The framing owes the peer exactly `header.size` body bytes. On
        // local read trouble mid-entry, zero-fill the rest; the hash
        // check on the far side discards the file.
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut written = 0u64;
        let mut read_failed = false;
        while written < header.size {
            if ctx.abort.pair_aborted(&local_tree.uuid, remote_tree) {
                return Err(Error::Cancelled);
            }
            let want = ((header.size - written) as usize).min(COPY_CHUNK);
            ctx.up_limit.throttle(want).await;
            match fh.read(&mut buf[..want]).await {
                Ok(0) => {
                    warn!("{} truncated under us mid-send", row.path);
                    read_failed = true;
                    break;
                }
                Ok(n) => {
                    timed("body write", async {
                        writer.write_all(&buf[..n]).await?;
                        Ok(())
                    })
                    .await?;
                    written += n as u64;
                    task.on_byte_transferred(n as u64);
                }
                Err(e) => {
                    warn!("reading {} failed mid-send: {e}", row.path);
                    read_failed = true;
                    break;
                }
            }
        }
        if read_failed {
            zero_fill(&mut writer, &ctx.up_limit, header.size - written).await?;
            task.on_file_skipped(1);
        } else {
            task.on_file_transferred(1);
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

    let response = timed_head("head read", http::read_response_head(&mut reader)).await?;
    if response.code != 200 {
        return Err(http::status_error(response.code));
    }
    Ok(())
}

/// Execute the pull-data half of a plan: request the paths, stage each
/// entry, verify its SHA-1, and apply. Mismatches skip; the next cycle
/// reconciles.
pub async fn pull(
    ctx: &TransferCtx,
    addr: &str,
    local_tree: &Tree,
    remote_tree: &str,
    datas: &[SyncFile],
) -> Result<u32> {
    if datas.is_empty() {
        return Ok(0);
    }

    let mut wanted: FxHashMap<String, FileMeta> = FxHashMap::default();
    let mut paths = Vec::with_capacity(datas.len());
    let mut total_bytes = 0i64;
    for action in datas {
        paths.push(action.src.path.clone());
        total_bytes += action.src.length;
        wanted.insert(action.src.path.clone(), action.src.clone());
    }

    let task = ctx.monitor.start_task(
        TransferKind::Get,
        &local_tree.uuid,
        remote_tree,
        datas.len() as u32,
        total_bytes,
    );

    let mut applier = Applier::new(&ctx.db, local_tree, &ctx.self_device)?;
    let staging = StagingDir::create(&local_tree.root)?;

    let stream = connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(COPY_CHUNK, read_half);
    let mut writer = BufWriter::new(write_half);

    timed("head write", async {
        http::write_request_head(
            &mut writer,
            &http::RequestHead {
                method: http::Method::GetTar,
                remote_tree: remote_tree.to_owned(),
                local_tree: Some(local_tree.uuid.clone()),
                total_size: 0,
                total_files: paths.len() as u32,
            },
        )
        .await
    })
    .await?;
    write_record(&mut writer, &PathList { paths }).await?;
    timed("request flush", async {
        writer.flush().await?;
        Ok(())
    })
    .await?;

    let response = timed_head("head read", http::read_response_head(&mut reader)).await?;
    if response.code != 200 {
        return Err(http::status_error(response.code));
    }

    let mut applied = 0;
    let mut decoder = tar::HeaderDecoder::new();
    let mut entry_index = 0usize;
    loop {
        if ctx.abort.pair_aborted(&local_tree.uuid, remote_tree) {
            return Err(Error::Cancelled);
        }
        let mut block = [0u8; tar::BLOCK_SIZE];
        timed("entry header read", async {
            reader.read_exact(&mut block).await?;
            Ok(())
        })
        .await?;
        match decoder.decode_block(&block)? {
            tar::Decoded::End => break,
            tar::Decoded::NeedLongName(size) => {
                let mut payload = vec![0u8; size as usize];
                timed("long name read", async {
                    reader.read_exact(&mut payload).await?;
                    Ok(())
                })
                .await?;
                drain_exact(&mut reader, tar::padding_for(size) as u64).await?;
                decoder.feed_long_name(&payload);
            }
            tar::Decoded::Entry(header) => {
                let expected = wanted.get(&header.path).cloned();
                let staged_path = staging.entry(entry_index);
                entry_index += 1;

                let Some(expected) = expected else {
                    debug!("peer sent {} we never asked for", header.path);
                    drain_exact(&mut reader, header.size + tar::padding_for(header.size) as u64)
                        .await?;
                    continue;
                };

                task.on_file_transfer(&header.path);
                let mut staged = tokio::fs::File::create(&staged_path).await?;
                let got_hash = copy_exact(
                    &mut reader,
                    &mut staged,
                    header.size,
                    &ctx.down_limit,
                    |chunk| {
                        task.on_byte_transferred(chunk);
                        if ctx.abort.pair_aborted(&local_tree.uuid, remote_tree) {
                            return Err(Error::Cancelled);
                        }
                        Ok(())
                    },
                )
                .await?;
                staged.sync_all().await?;
                drop(staged);
                drain_exact(&mut reader, tar::padding_for(header.size) as u64).await?;

                let hash_ok = expected.sha1.is_some_and(|want| want == got_hash)
                    && header.size == expected.length.max(0) as u64;
                if !hash_ok {
                    // The file changed on the sender mid-transfer.
                    info!(
                        "{} arrived as {} but the plan wanted {:?}; deferring",
                        header.path, got_hash, expected.sha1
                    );
                    task.on_file_skipped(1);
                    let _ = std::fs::remove_file(&staged_path);
                    continue;
                }

                if applier.apply_data(expected, &staged_path)? {
                    applied += 1;
                    task.on_file_transferred(1);
                } else {
                    task.on_file_skipped(1);
                }
            }
        }
    }
    applier.flush()?;
    Ok(applied)
}

/// Pull one file's bytes without touching any tree: the download cache's
/// fetch path.
pub async fn download_one(
    addr: &str,
    remote_tree: &str,
    path: &str,
    limit: &RateLimiter,
) -> Result<(ContentHash, Vec<u8>)> {
    let stream = connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    timed("head write", async {
        http::write_request_head(
            &mut writer,
            &http::RequestHead {
                method: http::Method::GetTar,
                remote_tree: remote_tree.to_owned(),
                local_tree: None,
                total_size: 0,
                total_files: 1,
            },
        )
        .await
    })
    .await?;
    write_record(
        &mut writer,
        &PathList {
            paths: vec![path.to_owned()],
        },
    )
    .await?;
    timed("request flush", async {
        writer.flush().await?;
        Ok(())
    })
    .await?;

    let response = timed_head("head read", http::read_response_head(&mut reader)).await?;
    if response.code != 200 {
        return Err(http::status_error(response.code));
    }

    let mut decoder = tar::HeaderDecoder::new();
    loop {
        let mut block = [0u8; tar::BLOCK_SIZE];
        timed("entry header read", async {
            reader.read_exact(&mut block).await?;
            Ok(())
        })
        .await?;
        match decoder.decode_block(&block)? {
            tar::Decoded::End => {
                return Err(Error::not_found(format!("{path} on the peer")));
            }
            tar::Decoded::NeedLongName(size) => {
                let mut payload = vec![0u8; size as usize];
                timed("long name read", async {
                    reader.read_exact(&mut payload).await?;
                    Ok(())
                })
                .await?;
                drain_exact(&mut reader, tar::padding_for(size) as u64).await?;
                decoder.feed_long_name(&payload);
            }
            tar::Decoded::Entry(header) => {
                let mut bytes = Vec::with_capacity(header.size as usize);
                let hash = copy_exact(&mut reader, &mut bytes, header.size, limit, |_| Ok(()))
                    .await?;
                return Ok((hash, bytes));
            }
        }
    }
}

/// One-way upload: send local files into a remote tree without keeping
/// (or having) any metadata of our own. The receiver's indexer mints the
/// rows.
pub async fn upload(
    addr: &str,
    remote_tree: &str,
    files: &[(String, Utf8PathBuf)],
    limit: &RateLimiter,
) -> Result<u32> {
    let stream = connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::with_capacity(COPY_CHUNK, write_half);

    let mut total_size = 0u64;
    let mut sizes = Vec::with_capacity(files.len());
    for (_, abs) in files {
        let len = std::fs::metadata(abs)?.len();
        total_size += len;
        sizes.push(len);
    }

    timed("head write", async {
        http::write_request_head(
            &mut writer,
            &http::RequestHead {
                method: http::Method::Upload,
                remote_tree: remote_tree.to_owned(),
                local_tree: None,
                total_size,
                total_files: files.len() as u32,
            },
        )
        .await
    })
    .await?;

    let mut sent = 0;
    for ((rel, abs), size) in files.iter().zip(sizes) {
        let header = tar::EntryHeader {
            path: rel.clone(),
            size,
            kind: tar::EntryKind::Regular,
            mtime_secs: 0,
        };
        let mut fh = tokio::fs::File::open(abs).await?;
        timed("entry header write", async {
            writer.write_all(&tar::encode_entry(&header)).await?;
            Ok(())
        })
        .await?;
        copy_exact(&mut fh, &mut writer, size, limit, |_| Ok(())).await?;
        timed("entry padding write", async {
            writer.write_all(&vec![0u8; tar::padding_for(size)]).await?;
            Ok(())
        })
        .await?;
        sent += 1;
    }
    timed("stream end write", async {
        writer.write_all(&tar::end_of_stream()).await?;
        writer.flush().await?;
        Ok(())
    })
    .await?;

    let response = timed_head("head read", http::read_response_head(&mut reader)).await?;
    if response.code != 200 {
        return Err(http::status_error(response.code));
    }
    Ok(sent)
}

