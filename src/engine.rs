//! The explicit engine handle.
//!
//! Owns the runtime, the stores, the lock table, the transfer server,
//! and the sync scheduler; exposes the control plane. There are no
//! process-wide singletons - drop the handle after [`Engine::shutdown`]
//! and nothing of the engine survives.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use rusqlite::Connection;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::*;
use uuid::Uuid;

use crate::abort::Abort;
use crate::cache::DownloadCache;
use crate::config::Configuration;
use crate::db::{
    DEFAULT_SYNC_INTERVAL_MS, Db, Device, SyncFolder, SyncKind, SyncPerm, Tree, TreeRole, keys,
};
use crate::errors::{Error, Result};
use crate::indexer::{self, IndexOutcome};
use crate::meta::{FileMeta, FileStatus, check_rel};
use crate::monitor::{self, Monitor, TransferEntry, TreeStatus};
use crate::notify::{Event, EventListener, Notifier};
use crate::planner::{self, PlanInput, SyncFile};
use crate::store::MetaStore;
use crate::synclist::SyncList;
use crate::transfer::{Applier, TransferCtx, client, limiter::RateLimiter, server::TransferServer};
use crate::tree_mutex::TreeMutex;

pub struct Engine {
    shared: Arc<Shared>,
    runtime: Runtime,
}

struct Shared {
    ctx: Arc<TransferCtx>,
    cache: std::sync::Mutex<DownloadCache>,
    skips: Arc<Vec<Regex>>,
    sync_interval_ms: AtomicI64,
    server: tokio::sync::Mutex<Option<TransferServer>>,
    scheduler: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Bring everything up: store, self-device row, transfer server,
    /// scheduler.
    pub fn start(config: &Configuration) -> Result<Engine> {
        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir)?;
        let db = Arc::new(Db::open(&data_dir.join("zisync.db"))?);

        let self_device = match db.setting_str(keys::SELF_DEVICE)? {
            Some(uuid) => uuid,
            None => {
                let uuid = Uuid::new_v4().to_string();
                db.set_setting_str(keys::SELF_DEVICE, &uuid)?;
                uuid
            }
        };
        let route_port = db.setting_i64(keys::ROUTE_PORT, config.route_port() as i64)? as u16;
        let data_port = db.setting_i64(keys::DATA_PORT, config.data_port() as i64)? as u16;
        db.put_device(&Device {
            uuid: self_device.clone(),
            name: config.device_name(),
            platform: std::env::consts::OS.to_owned(),
            host: "127.0.0.1".to_owned(),
            route_port,
            data_port,
            trusted: true,
            deleted: false,
        })?;

        let upload_limit = db.setting_i64(
            keys::UPLOAD_LIMIT,
            config.upload_limit.map(|b| b.as_u64() as i64).unwrap_or(0),
        )? as u64;
        let download_limit = db.setting_i64(
            keys::DOWNLOAD_LIMIT,
            config.download_limit.map(|b| b.as_u64() as i64).unwrap_or(0),
        )? as u64;
        let sync_interval = db.setting_i64(keys::SYNC_INTERVAL_MS, DEFAULT_SYNC_INTERVAL_MS)?;

        let mut cache = DownloadCache::new(Connection::open(data_dir.join("cache.db"))?)?;
        let cache_volume = db.setting_i64(keys::CACHE_VOLUME, cache.volume()?)?;
        cache.set_volume(cache_volume)?;

        let mut skips = Vec::with_capacity(config.skips.len());
        for pattern in &config.skips {
            let re = Regex::new(pattern)
                .map_err(|e| Error::config(format!("bad skip pattern {pattern:?}: {e}")))?;
            skips.push(re);
        }

        let threads = db.setting_i64(keys::TRANSFER_THREADS, num_cpus::get().min(4) as i64)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads((threads.max(1)) as usize)
            .thread_name("zisync-io")
            .enable_all()
            .build()?;

        let ctx = Arc::new(TransferCtx {
            db: db.clone(),
            locks: TreeMutex::new(),
            abort: Abort::new(),
            monitor: Monitor::new(),
            notifier: Notifier::new(),
            up_limit: Arc::new(RateLimiter::new(upload_limit)),
            down_limit: Arc::new(RateLimiter::new(download_limit)),
            self_device,
        });

        let server = runtime.block_on(TransferServer::start(
            ctx.clone(),
            &format!("0.0.0.0:{data_port}"),
        ))?;
        info!("engine up as device {}", ctx.self_device);

        let shared = Arc::new(Shared {
            ctx,
            cache: std::sync::Mutex::new(cache),
            skips: Arc::new(skips),
            sync_interval_ms: AtomicI64::new(sync_interval),
            server: tokio::sync::Mutex::new(Some(server)),
            scheduler: std::sync::Mutex::new(None),
        });

        let scheduler = runtime.spawn(run_scheduler(shared.clone()));
        *shared.scheduler.lock().unwrap() = Some(scheduler);

        Ok(Engine { shared, runtime })
    }

    /// Cancel everything, close the sockets, wait for in-flight batches,
    /// and take the runtime down. Nothing survives this.
    pub fn shutdown(self) {
        info!("engine shutting down");
        self.shared.ctx.abort.shutdown();
        if let Some(scheduler) = self.shared.scheduler.lock().unwrap().take() {
            scheduler.abort();
        }
        let shared = self.shared.clone();
        self.runtime.block_on(async move {
            if let Some(server) = shared.server.lock().await.take() {
                server.stop().await;
            }
        });
        self.shared.ctx.locks.clear();
        monitor::log_counts();
        self.runtime.shutdown_timeout(Duration::from_secs(5));
    }

    /// Park the caller until Ctrl-C. The serve command's main loop.
    pub fn wait_for_ctrl_c(&self) {
        let _ = self.runtime.block_on(tokio::signal::ctrl_c());
    }

    // Identity & plumbing accessors

    pub fn device_uuid(&self) -> &str {
        &self.shared.ctx.self_device
    }

    pub fn db(&self) -> &Db {
        &self.shared.ctx.db
    }

    /// The address the data plane actually bound (useful when the
    /// configured port was 0).
    pub fn data_addr(&self) -> Option<std::net::SocketAddr> {
        self.runtime
            .block_on(async { self.shared.server.lock().await.as_ref().map(|s| s.local_addr()) })
    }

    pub fn register_listener(&self, listener: Arc<dyn EventListener>) {
        self.shared.ctx.notifier.register(listener);
    }

    // Sync & tree lifecycle

    pub fn create_sync(&self, name: &str, perm: SyncPerm, kind: SyncKind) -> Result<SyncFolder> {
        let sync = SyncFolder {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            perm,
            kind,
            creator: self.shared.ctx.self_device.clone(),
            deleted: false,
        };
        self.shared.ctx.db.put_sync(&sync)?;
        self.shared.ctx.notifier.emit(Event::SyncModify);
        Ok(sync)
    }

    pub fn destroy_sync(&self, sync_uuid: &str) -> Result<()> {
        for tree in self.shared.ctx.db.trees_of_sync(sync_uuid)? {
            self.shared.ctx.abort.kill_tree(&tree.uuid);
        }
        self.shared.ctx.db.destroy_sync(sync_uuid)?;
        self.shared.ctx.notifier.emit(Event::SyncModify);
        Ok(())
    }

    /// Join this device to a sync with a local root directory.
    pub fn create_tree(
        &self,
        sync_uuid: &str,
        root: &Utf8Path,
        role: TreeRole,
    ) -> Result<Tree> {
        self.shared.ctx.db.sync_folder(sync_uuid)?;
        if !root.is_absolute() {
            return Err(Error::config(format!("tree root {root} must be absolute")));
        }
        std::fs::create_dir_all(root)?;
        let tree = Tree {
            uuid: Uuid::new_v4().to_string(),
            sync_uuid: sync_uuid.to_owned(),
            device_uuid: self.shared.ctx.self_device.clone(),
            root: root.to_owned(),
            role,
            enabled: true,
        };
        self.shared.ctx.db.put_tree(&tree)?;
        self.shared.ctx.notifier.emit(Event::SyncModify);
        Ok(tree)
    }

    pub fn destroy_tree(&self, tree_uuid: &str) -> Result<()> {
        self.shared.ctx.abort.kill_tree(tree_uuid);
        self.shared.ctx.db.destroy_tree(tree_uuid)?;
        self.shared.ctx.notifier.emit(Event::SyncModify);
        Ok(())
    }

    // Pairing (the handshake itself is the management layer's business;
    // it tells us what it learned)

    pub fn add_device(&self, device: &Device) -> Result<()> {
        self.shared.ctx.db.put_device(device)
    }

    pub fn unbind_device(&self, uuid: &str) -> Result<()> {
        self.shared.ctx.db.unbind_device(uuid)
    }

    /// Record a peer device's tree of a sync we share.
    pub fn register_remote_tree(
        &self,
        tree_uuid: &str,
        sync_uuid: &str,
        device_uuid: &str,
        root: &Utf8Path,
        role: TreeRole,
    ) -> Result<()> {
        self.shared.ctx.db.sync_folder(sync_uuid)?;
        self.shared.ctx.db.device(device_uuid)?;
        self.shared.ctx.db.put_tree(&Tree {
            uuid: tree_uuid.to_owned(),
            sync_uuid: sync_uuid.to_owned(),
            device_uuid: device_uuid.to_owned(),
            root: root.to_owned(),
            role,
            enabled: true,
        })
    }

    // Favorites

    pub fn add_favorite(&self, tree_uuid: &str, path: &str) -> Result<bool> {
        check_rel(path)?;
        let added = self.shared.ctx.db.add_favorite(tree_uuid, path)?;
        if added {
            self.shared.ctx.notifier.emit(Event::SyncModify);
        }
        Ok(added)
    }

    pub fn remove_favorite(&self, tree_uuid: &str, path: &str) -> Result<bool> {
        let removed = self.shared.ctx.db.remove_favorite(tree_uuid, path)?;
        if removed {
            self.shared.ctx.notifier.emit(Event::SyncModify);
        }
        Ok(removed)
    }

    // The verbs

    /// Index one local tree right now.
    pub fn index_once(&self, tree_uuid: &str) -> Result<IndexOutcome> {
        let ctx = &self.shared.ctx;
        let tree = ctx.db.tree(tree_uuid)?;
        if tree.device_uuid != ctx.self_device {
            return Err(Error::config(format!("tree {tree_uuid} isn't on this device")));
        }
        indexer::index_tree(
            &ctx.db,
            &tree,
            &ctx.self_device,
            &ctx.locks,
            &ctx.abort,
            &ctx.notifier,
            &self.shared.skips,
        )
    }

    /// Run a full sync of every tree pair in the sync, now, and wait for
    /// it.
    pub fn sync_once(&self, sync_uuid: &str) -> Result<()> {
        self.runtime
            .block_on(sync_once_inner(&self.shared, sync_uuid))
    }

    /// Fetch one file's bytes on demand, via the download cache.
    pub fn download_file(&self, sync_uuid: &str, path: &str) -> Result<Vec<u8>> {
        check_rel(path)?;
        if let Some((_, bytes)) = self
            .shared
            .cache
            .lock()
            .unwrap()
            .try_read(sync_uuid, path)?
        {
            monitor::bump(monitor::Op::CacheHit);
            return Ok(bytes);
        }
        monitor::bump(monitor::Op::CacheMiss);
        let bytes = self
            .runtime
            .block_on(download_uncached(&self.shared, sync_uuid, path))?;
        self.shared
            .ctx
            .notifier
            .emit(Event::DownloadFileNumber(1));
        Ok(bytes)
    }

    /// One-way upload of local files into a peer's tree.
    pub fn upload_files(
        &self,
        remote_tree_uuid: &str,
        files: &[(String, Utf8PathBuf)],
    ) -> Result<u32> {
        let ctx = &self.shared.ctx;
        let tree = ctx.db.tree(remote_tree_uuid)?;
        let device = ctx.db.device(&tree.device_uuid)?;
        let addr = format!("{}:{}", device.host, device.data_port);
        self.runtime
            .block_on(client::upload(&addr, remote_tree_uuid, files, &ctx.up_limit))
    }

    // Cancellation without destruction: in-flight work against the tree
    // unwinds at its next safe point.

    pub fn cancel_tree(&self, tree_uuid: &str) {
        self.shared.ctx.abort.kill_tree(tree_uuid);
    }

    pub fn resume_tree(&self, tree_uuid: &str) {
        self.shared.ctx.abort.revive_tree(tree_uuid);
    }

    // Observability

    pub fn query_tree_status(&self, tree_uuid: &str) -> TreeStatus {
        self.shared.ctx.monitor.tree_status(tree_uuid)
    }

    pub fn query_transfer_list(&self) -> Vec<TransferEntry> {
        self.shared.ctx.monitor.transfer_list()
    }

    // Knobs. All persist; some only shape the next start.

    pub fn set_upload_limit(&self, bytes_per_sec: u64) -> Result<()> {
        self.shared
            .ctx
            .db
            .set_setting_i64(keys::UPLOAD_LIMIT, bytes_per_sec as i64)?;
        self.shared.ctx.up_limit.set_rate(bytes_per_sec);
        Ok(())
    }

    pub fn set_download_limit(&self, bytes_per_sec: u64) -> Result<()> {
        self.shared
            .ctx
            .db
            .set_setting_i64(keys::DOWNLOAD_LIMIT, bytes_per_sec as i64)?;
        self.shared.ctx.down_limit.set_rate(bytes_per_sec);
        Ok(())
    }

    pub fn set_sync_interval(&self, interval: Duration) -> Result<()> {
        let ms = interval.as_millis() as i64;
        self.shared.ctx.db.set_setting_i64(keys::SYNC_INTERVAL_MS, ms)?;
        self.shared.sync_interval_ms.store(ms, Ordering::Relaxed);
        Ok(())
    }

    /// Takes effect at the next engine start; the running reactor keeps
    /// its pool.
    pub fn set_transfer_thread_count(&self, threads: usize) -> Result<()> {
        self.shared
            .ctx
            .db
            .set_setting_i64(keys::TRANSFER_THREADS, threads.max(1) as i64)
    }

    pub fn set_download_cache_volume(&self, bytes: i64) -> Result<()> {
        self.shared.ctx.db.set_setting_i64(keys::CACHE_VOLUME, bytes)?;
        self.shared.cache.lock().unwrap().set_volume(bytes)
    }

    /// Stored for the discovery collaborator; the engine itself never
    /// listens there.
    pub fn set_discover_port(&self, port: u16) -> Result<()> {
        self.shared
            .ctx
            .db
            .set_setting_i64(keys::DISCOVER_PORT, port as i64)
    }

    pub fn set_route_port(&self, port: u16) -> Result<()> {
        self.shared.ctx.db.set_setting_i64(keys::ROUTE_PORT, port as i64)?;
        self.update_self_device(|d| d.route_port = port)
    }

    /// Rebind the data plane right away.
    pub fn set_data_port(&self, port: u16) -> Result<()> {
        self.shared.ctx.db.set_setting_i64(keys::DATA_PORT, port as i64)?;
        self.update_self_device(|d| d.data_port = port)?;
        let shared = self.shared.clone();
        self.runtime.block_on(async move {
            let mut slot = shared.server.lock().await;
            if let Some(server) = slot.take() {
                server.stop().await;
            }
            let server =
                TransferServer::start(shared.ctx.clone(), &format!("0.0.0.0:{port}")).await?;
            *slot = Some(server);
            Ok(())
        })
    }

    fn update_self_device(&self, change: impl FnOnce(&mut Device)) -> Result<()> {
        let mut device = self.shared.ctx.db.device(&self.shared.ctx.self_device)?;
        change(&mut device);
        self.shared.ctx.db.put_device(&device)
    }
}

async fn run_scheduler(shared: Arc<Shared>) {
    loop {
        let interval = shared.sync_interval_ms.load(Ordering::Relaxed).max(1_000) as u64;
        tokio::time::sleep(Duration::from_millis(interval)).await;
        if shared.ctx.abort.is_shutdown() {
            break;
        }
        let syncs = match shared.ctx.db.sync_folders() {
            Ok(syncs) => syncs,
            Err(e) => {
                warn!("scheduler couldn't list syncs: {e}");
                continue;
            }
        };
        for sync in syncs {
            if shared.ctx.abort.is_shutdown() {
                return;
            }
            match sync_once_inner(&shared, &sync.uuid).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    debug!("scheduled sync of {} deferred: {e}", sync.name);
                }
                Err(Error::Cancelled) => {}
                Err(e) => warn!("scheduled sync of {} failed: {e}", sync.name),
            }
        }
    }
}

async fn sync_once_inner(shared: &Arc<Shared>, sync_uuid: &str) -> Result<()> {
    let ctx = &shared.ctx;
    let sync = ctx.db.sync_folder(sync_uuid)?;
    if sync.perm == SyncPerm::Disconnected {
        return Err(Error::permission(format!("sync {} is disconnected", sync.name)));
    }

    let trees = ctx.db.trees_of_sync(&sync.uuid)?;
    let tree_uuids = ctx.db.sync_tree_uuids(&sync.uuid)?;
    let locals: Vec<&Tree> = trees
        .iter()
        .filter(|t| t.enabled && t.device_uuid == ctx.self_device)
        .collect();
    let remotes: Vec<&Tree> = trees
        .iter()
        .filter(|t| t.enabled && t.device_uuid != ctx.self_device)
        .collect();

    // Fresh rows before planning.
    for local in &locals {
        let db = ctx.db.clone();
        let tree = (*local).clone();
        let self_device = ctx.self_device.clone();
        let locks = ctx.locks.clone();
        let abort = ctx.abort.clone();
        let notifier = ctx.notifier.clone();
        let skips = shared.skips.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            indexer::index_tree(&db, &tree, &self_device, &locks, &abort, &notifier, &skips)
        })
        .await
        .expect("indexer task panicked");
        match outcome {
            Ok(_) => {}
            // Someone's already working on the tree; plan off the rows we
            // have.
            Err(Error::Again(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let mut first_error = None;
    for &local in &locals {
        for &remote in &remotes {
            match sync_pair(shared, &sync, local, remote, &tree_uuids).await {
                Ok(()) => {}
                Err(Error::Again(_)) => {}
                Err(e) => {
                    error!(
                        "sync {} pair ({}, {}): {e}",
                        sync.name, local.uuid, remote.uuid
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

async fn sync_pair(
    shared: &Arc<Shared>,
    sync: &SyncFolder,
    local: &Tree,
    remote: &Tree,
    tree_uuids: &[String],
) -> Result<()> {
    let ctx = &shared.ctx;
    ctx.notifier.emit(Event::SyncStart {
        sync: sync.uuid.clone(),
        local_tree: local.uuid.clone(),
        remote_tree: remote.uuid.clone(),
    });
    monitor::bump(monitor::Op::SyncRun);

    let result = sync_pair_locked(shared, sync, local, remote, tree_uuids).await;

    ctx.notifier.emit(Event::SyncFinish {
        sync: sync.uuid.clone(),
        local_tree: local.uuid.clone(),
        remote_tree: remote.uuid.clone(),
        status: match &result {
            Ok(()) => "ok".to_owned(),
            Err(e) => e.category().to_owned(),
        },
    });
    result
}

async fn sync_pair_locked(
    shared: &Arc<Shared>,
    sync: &SyncFolder,
    local: &Tree,
    remote: &Tree,
    tree_uuids: &[String],
) -> Result<()> {
    let ctx = &shared.ctx;

    // When an initiator here races an incoming session for the same pair,
    // exactly one side backs off briefly: the one with the greater tree
    // uuid. The other stays refused and its cycle moves on.
    let _pair = match ctx.locks.try_lock(&local.uuid, &remote.uuid) {
        Some(guard) => guard,
        None if local.uuid > remote.uuid => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.locks
                .try_lock(&local.uuid, &remote.uuid)
                .ok_or(Error::Again("tree pair is busy"))?
        }
        None => return Err(Error::Again("tree pair is busy")),
    };
    if ctx.abort.pair_aborted(&local.uuid, &remote.uuid) {
        return Err(Error::Cancelled);
    }

    let device = ctx.db.device(&remote.device_uuid)?;
    let addr = format!("{}:{}", device.host, device.data_port);

    let snapshot = client::fetch_meta(&addr, &local.uuid, &remote.uuid).await?;
    let remote_list = SyncList::from_entries(&snapshot.synclist);
    let mut remote_rows: Vec<FileMeta> = snapshot
        .stats
        .into_iter()
        .map(|s| s.into_meta(&snapshot.tree_uuids))
        .collect();
    remote_rows.sort_by(|a, b| a.path.cmp(&b.path));

    let local_rows = MetaStore::open(ctx.db.path(), &local.uuid)?.scan_all()?;
    let local_list = ctx.db.synclist(&local.uuid)?;

    let plan = planner::plan(PlanInput {
        sync,
        local_tree: local,
        remote_tree: remote,
        local_rows,
        remote_rows,
        local_list: &local_list,
        remote_list: &remote_list,
    });
    debug!(
        "pair ({}, {}): {} actions, {} files already consistent",
        local.uuid,
        remote.uuid,
        plan.action_count(),
        plan.consistent_files
    );

    // Pull phase, under the self-lock so no index runs underneath the
    // applies.
    if !plan.pull_remove_metas.is_empty()
        || !plan.pull_make_metas.is_empty()
        || !plan.pull_renames.is_empty()
        || !plan.pull_datas.is_empty()
    {
        let _self_lock = ctx
            .locks
            .try_lock(&local.uuid, &local.uuid)
            .ok_or(Error::Again("tree is busy"))?;

        let mut applier = Applier::new(&ctx.db, local, &ctx.self_device)?;
        let mut fallback_datas: Vec<SyncFile> = Vec::new();
        for action in &plan.pull_remove_metas {
            if ctx.abort.pair_aborted(&local.uuid, &remote.uuid) {
                return Err(Error::Cancelled);
            }
            applier.apply_meta(action.src.clone())?;
        }
        for action in &plan.pull_make_metas {
            if ctx.abort.pair_aborted(&local.uuid, &remote.uuid) {
                return Err(Error::Cancelled);
            }
            applier.apply_meta(action.src.clone())?;
        }
        for pair in &plan.pull_renames {
            if ctx.abort.pair_aborted(&local.uuid, &remote.uuid) {
                return Err(Error::Cancelled);
            }
            if !applier.apply_rename(pair.from.src.clone(), pair.to.src.clone())? {
                // The local bytes drifted; fetch the new path for real.
                fallback_datas.push(pair.to.clone());
            }
        }
        applier.flush()?;
        let applied_meta = applier.applied;
        drop(applier);

        let mut datas = plan.pull_datas.clone();
        datas.extend(fallback_datas);
        let pulled = client::pull(ctx, &addr, local, &remote.uuid, &datas).await?;
        if applied_meta > 0 || pulled > 0 {
            ctx.notifier.emit(Event::SyncModify);
        }
    }

    // Push phase; the peer ingests the manifest and re-checks everything
    // on its side.
    client::push(ctx, &addr, tree_uuids, local, &remote.uuid, &plan).await?;
    Ok(())
}

async fn download_uncached(shared: &Arc<Shared>, sync_uuid: &str, path: &str) -> Result<Vec<u8>> {
    let ctx = &shared.ctx;
    let trees = ctx.db.trees_of_sync(sync_uuid)?;
    let mut last_err = Error::not_found(format!("{path} on any peer"));

    for tree in trees
        .iter()
        .filter(|t| t.enabled && t.device_uuid != ctx.self_device)
    {
        let Ok(device) = ctx.db.device(&tree.device_uuid) else {
            continue;
        };
        let addr = format!("{}:{}", device.host, device.data_port);

        let snapshot = match client::fetch_meta(&addr, "", &tree.uuid).await {
            Ok(s) => s,
            Err(e) => {
                last_err = e;
                continue;
            }
        };
        let row = snapshot
            .stats
            .iter()
            .find(|s| s.path == path && s.status == FileStatus::Normal);
        let Some(row) = row else {
            continue;
        };
        let expected = row.sha1;

        match client::download_one(&addr, &tree.uuid, path, &ctx.down_limit).await {
            Ok((hash, bytes)) => {
                if expected.is_some_and(|want| want != hash) {
                    last_err = Error::content(format!("{path} arrived with the wrong hash"));
                    continue;
                }
                shared
                    .cache
                    .lock()
                    .unwrap()
                    .insert(sync_uuid, path, &hash, &bytes)?;
                return Ok(bytes);
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}
