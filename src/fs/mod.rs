mod convert;
pub mod file_handle;
pub mod fs_lock;
pub mod node_table;
pub mod open_files;
pub mod path_context;
pub mod registry;

pub use fs_lock::FsLockTable;
pub use node_table::{fnv1a64, inode_for_path, NodeTable};
pub use open_files::OpenFileTracker;
pub use path_context::{join_virtual_path, PathContext, GLOBUS_TRANSFER_TYPE, TRANSFER_TYPES};
pub use registry::ProjectTransferRegistry;

use crate::bytestore::ByteStore;
use crate::error::BridgeError;
use crate::globus::GlobusClient;
use crate::model::{File as MCFile, TransferRequest};
use crate::monitor::activity::ActivityCounter;
use crate::store::{FileStore, ProjectStore, TransferStore, UserStore};
use convert::{error_to_errno, io_error_to_libc};
use file_handle::{FileHandle, HandleTable};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Process-wide bridge state: the stores, the byte store, and the shared
/// concurrent structures (tracker, registry, lock table, activity counter).
/// Constructed once per process and shared by the filesystem, its handles,
/// and the monitors.
pub struct Engine {
    pub byte_store: ByteStore,
    pub file_store: FileStore,
    pub project_store: ProjectStore,
    pub user_store: UserStore,
    pub transfer_store: TransferStore,
    pub tracker: OpenFileTracker,
    pub registry: ProjectTransferRegistry,
    pub locks: FsLockTable,
    pub activity: ActivityCounter,
    pub api_url: String,
    pub http: reqwest::Client,
}

impl Engine {
    pub fn new(
        settings: &crate::config::Settings,
        pool: sqlx::MySqlPool,
        globus: Arc<GlobusClient>,
    ) -> Engine {
        let byte_store = ByteStore::new(&settings.mcfs_dir);
        let transfer_store = TransferStore::new(pool.clone(), settings.tx_retry);
        let project_store = ProjectStore::new(pool.clone());
        let user_store = UserStore::new(pool.clone());

        Engine {
            file_store: FileStore::new(pool.clone(), byte_store.clone(), settings.tx_retry),
            registry: ProjectTransferRegistry::new(
                transfer_store.clone(),
                project_store.clone(),
                user_store.clone(),
                globus,
                settings.globus_endpoint_id.clone(),
            ),
            byte_store,
            project_store,
            user_store,
            transfer_store,
            tracker: OpenFileTracker::new(),
            locks: FsLockTable::new(),
            activity: ActivityCounter::new(),
            api_url: settings.api_url.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Payload UUID for a metadata row: dedup pointers share the bytes of
    /// the row they reference and have no payload of their own.
    pub fn payload_uuid(file: &MCFile) -> &str {
        file.uses_uuid.as_deref().unwrap_or(&file.uuid)
    }
}

const BLOCK_SIZE: u32 = 512;

/// The kernel-facing filesystem. FUSE callbacks are synchronous; database
/// and HTTP work runs on the captured runtime handle.
pub struct BridgeFs {
    engine: Arc<Engine>,
    rt: tokio::runtime::Handle,
    nodes: NodeTable,
    handles: HandleTable,
    uid: u32,
    gid: u32,
    ttl: Duration,
}

impl BridgeFs {
    pub fn new(engine: Arc<Engine>, rt: tokio::runtime::Handle) -> BridgeFs {
        BridgeFs {
            engine,
            rt,
            nodes: NodeTable::new(),
            handles: HandleTable::new(),
            // Owner is always the process the bridge runs as.
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            ttl: Duration::from_secs(1),
        }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    fn dir_attr(&self, ino: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn file_attr_from_metadata(&self, meta: &std::fs::Metadata, ino: u64) -> FileAttr {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let atime = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
        FileAttr {
            ino,
            size: meta.len(),
            blocks: meta.len().div_ceil(u64::from(BLOCK_SIZE)),
            atime,
            mtime,
            ctime: mtime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes for a lookup reply, taken from the metadata row rather
    /// than a stat: a newer version may be in flight and the row is what
    /// this transfer is supposed to see.
    fn entry_attr(&self, file: &MCFile, ino: u64) -> FileAttr {
        if file.is_dir() {
            return self.dir_attr(ino);
        }

        let now = SystemTime::now();
        let mtime: SystemTime = file.updated_at.into();
        FileAttr {
            ino,
            size: file.size.max(0) as u64,
            blocks: (file.size.max(0) as u64).div_ceil(u64::from(BLOCK_SIZE)),
            atime: now,
            mtime,
            ctime: now,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn resolve_request(&self, ctx: &PathContext) -> std::result::Result<TransferRequest, i32> {
        self.block_on(self.engine.registry.get(ctx))
            .map_err(|e| error_to_errno(&e))
    }

    /// Attributes for getattr: directories report "now"; regular files stat
    /// the underlying payload, preferring the tracker's in-flight version.
    fn attr_for_node(&self, ino: u64) -> std::result::Result<FileAttr, i32> {
        let node = self.nodes.get(ino).ok_or(libc::ENOENT)?;

        let file = match node.file {
            None => return Ok(self.dir_attr(ino)),
            Some(f) if f.is_dir() => return Ok(self.dir_attr(ino)),
            Some(f) => f,
        };

        let effective = self.engine.tracker.get_file(&node.vpath).unwrap_or(file);
        let payload = self.engine.byte_store.file_path(Engine::payload_uuid(&effective));
        match std::fs::metadata(&payload) {
            Ok(meta) => Ok(self.file_attr_from_metadata(&meta, ino)),
            Err(e) => Err(io_error_to_libc(&e)),
        }
    }

    /// Entries for the three synthetic layers above a project root.
    fn list_upper_layer(
        &self,
        ctx: &PathContext,
        vpath: &str,
    ) -> std::result::Result<Vec<(String, FileType)>, i32> {
        if ctx.is_root() {
            return Ok(TRANSFER_TYPES
                .iter()
                .map(|t| (t.to_string(), FileType::Directory))
                .collect());
        }

        if ctx.is_transfer_type() {
            let users = self
                .block_on(self.engine.user_store.get_users_with_globus_account())
                .map_err(|_| libc::ENOENT)?;
            return Ok(users
                .into_iter()
                .map(|u| (u.id.to_string(), FileType::Directory))
                .collect());
        }

        // User level: one entry per project the user can reach.
        let projects = self
            .block_on(self.engine.project_store.get_projects_for_user(ctx.user_id))
            .map_err(|_| libc::ENOENT)?;
        tracing::debug!("readdir {}: {} projects", vpath, projects.len());
        Ok(projects
            .into_iter()
            .map(|p| (p.id.to_string(), FileType::Directory))
            .collect())
    }

    fn list_project_dir(
        &self,
        ctx: &PathContext,
        vpath: &str,
    ) -> std::result::Result<Vec<(String, FileType)>, i32> {
        let request = self.resolve_request(ctx)?;

        let dir = self
            .block_on(
                self.engine
                    .file_store
                    .find_dir_by_path(ctx.project_id, ctx.fs_path()),
            )
            .map_err(|_| libc::ENOENT)?
            .ok_or(libc::ENOENT)?;

        let rows = self
            .block_on(self.engine.file_store.list_directory(&dir, &request))
            .map_err(|_| libc::ENOENT)?;

        tracing::debug!("readdir {}: {} entries", vpath, rows.len());
        Ok(rows
            .into_iter()
            .map(|row| {
                let kind = if row.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                (row.name, kind)
            })
            .collect())
    }

    /// Fire-and-forget request asking the metadata service to generate
    /// derived representations for a newly released file.
    fn spawn_convert_request(&self, file: &MCFile) {
        let engine = self.engine.clone();
        let file_id = file.id;
        let project_id = file.project_id;
        let owner_id = file.owner_id;

        self.rt.spawn(async move {
            let token = match engine.user_store.get_user(owner_id).await {
                Ok(Some(user)) => user.api_token.unwrap_or_default(),
                _ => String::new(),
            };

            let body = serde_json::json!({
                "file_id": file_id,
                "project_id": project_id,
            });

            let result = engine
                .http
                .post(format!("{}/convert-file", engine.api_url))
                .bearer_auth(token)
                .json(&body)
                .send()
                .await;

            if let Err(e) = result {
                tracing::error!("Failed calling convert-file for file {}: {}", file_id, e);
            }
        });
    }
}

impl Filesystem for BridgeFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("Bridge filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("Bridge filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_vpath) = self.nodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        let child_vpath = join_virtual_path(&parent_vpath, name);
        let ctx = PathContext::parse(&child_vpath);
        tracing::debug!("lookup(parent={:?}, name={:?})", parent_vpath, name);

        if ctx.is_path() {
            let request = match self.resolve_request(&ctx) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };

            let file = match self.block_on(
                self.engine
                    .file_store
                    .get_file_by_path(ctx.fs_path(), &request),
            ) {
                Ok(Some(f)) => f,
                Ok(None) => {
                    reply.error(libc::ENOENT);
                    return;
                }
                Err(e) => {
                    reply.error(error_to_errno(&e));
                    return;
                }
            };

            let ino = self.nodes.insert(child_vpath, Some(file.clone()));
            reply.entry(&self.ttl, &self.entry_attr(&file, ino), 0);
            return;
        }

        // Layers above a project root are in-memory directories; validate
        // the component against what readdir would have listed.
        let exists = if ctx.is_transfer_type() {
            TRANSFER_TYPES.contains(&ctx.transfer_type.as_str())
        } else if ctx.is_user() {
            matches!(
                self.block_on(self.engine.user_store.get_user(ctx.user_id)),
                Ok(Some(_))
            )
        } else if ctx.is_project() {
            matches!(
                self.block_on(self.engine.project_store.get_project(ctx.project_id)),
                Ok(Some(_))
            )
        } else {
            false
        };

        if !exists {
            reply.error(libc::ENOENT);
            return;
        }

        let ino = self.nodes.insert(child_vpath, None);
        reply.entry(&self.ttl, &self.dir_attr(ino), 0);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        match self.attr_for_node(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Only the size attribute is honored.
        if let (Some(size), Some(fh)) = (size, fh) {
            let Some(handle) = self.handles.get(fh) else {
                reply.error(libc::EBADF);
                return;
            };

            let file = handle.file.lock();
            if let Err(e) = file.set_len(size) {
                reply.error(io_error_to_libc(&e));
                return;
            }

            match file.metadata() {
                Ok(meta) => reply.attr(&self.ttl, &self.file_attr_from_metadata(&meta, ino)),
                Err(e) => reply.error(io_error_to_libc(&e)),
            }
            return;
        }

        match self.attr_for_node(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(vpath) = self.nodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ctx = PathContext::parse(&vpath);
        tracing::debug!("opendir({})", vpath);

        if ctx.is_root() || ctx.is_transfer_type() || ctx.is_user() {
            reply.opened(0, 0);
            return;
        }

        if ctx.is_project() {
            // First open of a project lazily creates or hydrates the
            // transfer request and its ACL grant.
            match self.block_on(self.engine.registry.get_or_create(&ctx)) {
                Ok(_) => reply.opened(0, 0),
                Err(e) => {
                    tracing::warn!("opendir {} rejected: {}", vpath, e);
                    reply.error(error_to_errno(&e));
                }
            }
            return;
        }

        if ctx.is_path() {
            // Below the project root the transfer must already exist.
            match self.block_on(self.engine.registry.get(&ctx)) {
                Ok(_) => reply.opened(0, 0),
                Err(_) => reply.error(libc::EPERM),
            }
            return;
        }

        reply.error(libc::EPERM);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(vpath) = self.nodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ctx = PathContext::parse(&vpath);
        tracing::debug!("readdir({}, offset={})", vpath, offset);

        let listing = if ctx.is_project() || ctx.is_path() {
            self.list_project_dir(&ctx, &vpath)
        } else {
            self.list_upper_layer(&ctx, &vpath)
        };

        let entries = match listing {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let mut idx = 0i64;
        for (name, kind) in entries {
            if idx < offset {
                idx += 1;
                continue;
            }

            let child_ino = inode_for_path(&join_virtual_path(&vpath, &name));
            if reply.add(child_ino, idx + 1, kind, &name) {
                break;
            }
            idx += 1;
        }

        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_vpath) = self.nodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };

        let ctx = PathContext::parse(&parent_vpath);
        if !ctx.is_project() && !ctx.is_path() {
            reply.error(libc::EINVAL);
            return;
        }

        let request = match self.resolve_request(&ctx) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let result = self.block_on(async {
            let parent_dir = self
                .engine
                .file_store
                .find_dir_by_path(ctx.project_id, ctx.fs_path())
                .await?
                .ok_or(BridgeError::Db(sqlx::Error::RowNotFound))?;

            self.engine
                .file_store
                .create_directory(&parent_dir, &ctx.to_fs_path(name), name, &request)
                .await
        });

        match result {
            Ok(dir) => {
                let child_vpath = join_virtual_path(&parent_vpath, name);
                let ino = self.nodes.insert(child_vpath, Some(dir));
                reply.entry(&self.ttl, &self.dir_attr(ino), 0);
            }
            Err(e) => {
                tracing::error!("mkdir {}/{} failed: {}", parent_vpath, name, e);
                reply.error(libc::EINVAL);
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_vpath) = self.nodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        tracing::debug!("create({}/{}, flags={:#x})", parent_vpath, name, flags);

        let ctx = PathContext::parse(&parent_vpath);
        if !ctx.is_project() && !ctx.is_path() {
            reply.error(libc::EPERM);
            return;
        }

        let request = match self.resolve_request(&ctx) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let file = match self.block_on(async {
            let dir = self
                .engine
                .file_store
                .find_dir_by_path(ctx.project_id, ctx.fs_path())
                .await?
                .ok_or(BridgeError::Db(sqlx::Error::RowNotFound))?;

            self.engine.file_store.create_new_file(name, &dir, &request).await
        }) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("create {}/{} failed: {}", parent_vpath, name, e);
                reply.error(libc::EIO);
                return;
            }
        };

        let child_vpath = join_virtual_path(&parent_vpath, name);
        self.engine.tracker.store(&child_vpath, file.clone());

        let open_flags = flags & !libc::O_APPEND;
        let accmode = open_flags & libc::O_ACCMODE;
        let fd = match OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(accmode != libc::O_RDONLY)
            .create(true)
            .truncate(open_flags & libc::O_TRUNC != 0)
            .mode(mode & 0o7777)
            .open(self.engine.byte_store.file_path(&file.uuid))
        {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!("create: open of new payload failed: {}", e);
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        let attr = match fd.metadata() {
            Ok(meta) => self.file_attr_from_metadata(&meta, inode_for_path(&child_vpath)),
            Err(e) => {
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        self.nodes.insert(child_vpath.clone(), Some(file));
        let fh = self.handles.insert(FileHandle::new(
            fd,
            open_flags,
            child_vpath,
            ctx.project_key(),
        ));

        reply.created(&self.ttl, &attr, 0, fh, 0);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.nodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        tracing::debug!("open({}, flags={:#x})", node.vpath, flags);

        let Some(file) = node.file else {
            reply.error(libc::EISDIR);
            return;
        };
        if file.is_dir() {
            reply.error(libc::EISDIR);
            return;
        }

        let ctx = PathContext::parse(&node.vpath);
        let accmode = flags & libc::O_ACCMODE;

        let target = match accmode {
            libc::O_RDONLY => self.engine.tracker.get_file(&node.vpath),
            libc::O_WRONLY | libc::O_RDWR => {
                match self.engine.tracker.get_file(&node.vpath) {
                    Some(f) => Some(f),
                    None => {
                        // No in-flight version for this transfer yet:
                        // synthesize one with its own payload.
                        let request = match self.resolve_request(&ctx) {
                            Ok(r) => r,
                            Err(errno) => {
                                reply.error(errno);
                                return;
                            }
                        };

                        let new_file = match self.block_on(
                            self.engine.file_store.create_new_file_version(&file, &request),
                        ) {
                            Ok(f) => f,
                            Err(e) => {
                                tracing::error!(
                                    "open: creating new version of {} failed: {}",
                                    node.vpath,
                                    e
                                );
                                reply.error(libc::EIO);
                                return;
                            }
                        };

                        self.engine.tracker.store(&node.vpath, new_file.clone());
                        Some(new_file)
                    }
                }
            }
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        let open_flags = flags & !(libc::O_CREAT | libc::O_APPEND);
        let effective = target.unwrap_or(file);
        let payload = self.engine.byte_store.file_path(Engine::payload_uuid(&effective));

        let fd = match OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(accmode != libc::O_RDONLY)
            .truncate(accmode != libc::O_RDONLY && open_flags & libc::O_TRUNC != 0)
            .open(&payload)
        {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!("open: payload open {} failed: {}", payload.display(), e);
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        let fh = self.handles.insert(FileHandle::new(
            fd,
            open_flags,
            node.vpath.clone(),
            ctx.project_key(),
        ));
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let file = handle.file.lock();
        self.engine.activity.increment();

        let mut buf = vec![0u8; size as usize];
        match file.read_at(&mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        // The task monitor quiesces a project while it retires completed
        // uploads; writes are refused until it finishes.
        if self.engine.locks.is_locked(&handle.project_key) {
            reply.error(libc::EIO);
            return;
        }

        let file = handle.file.lock();
        self.engine.activity.increment();

        match file.write_at(data, offset as u64) {
            Ok(n) => {
                if n > 0 {
                    if let Some(open_file) = self.engine.tracker.get(&handle.vpath) {
                        open_file.consume(&data[..n]);
                    }
                }
                handle.add_written(n as u64);
                reply.written(n as u32);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.handles.get(fh).is_none() {
            reply.error(libc::EBADF);
            return;
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.handles.remove(fh) else {
            reply.ok();
            return;
        };

        let vpath = handle.vpath.clone();
        let read_only = handle.is_read_only();
        let bytes_written = handle.bytes_written() as i64;

        // Wait out any in-flight I/O on the handle, then close the
        // descriptor before the release pipeline stats the payload.
        {
            let _guard = handle.file.lock();
        }
        drop(handle);

        if read_only {
            reply.ok();
            return;
        }

        tracing::debug!("release({}, {} bytes written)", vpath, bytes_written);

        // Prefer the tracker's in-flight version over the node's cached row.
        let open_file = self.engine.tracker.get(&vpath);
        let (file_to_update, checksum) = match &open_file {
            Some(of) => (of.file.clone(), of.checksum()),
            None => match self.nodes.get(ino).and_then(|n| n.file) {
                Some(f) => (f, String::new()),
                None => {
                    reply.error(libc::EIO);
                    return;
                }
            },
        };

        let ctx = PathContext::parse(&vpath);
        let result = self.block_on(async {
            self.engine
                .file_store
                .mark_file_released(&file_to_update, &checksum, ctx.project_id, bytes_written)
                .await?;

            if !checksum.is_empty() {
                if let Some(existing) = self
                    .engine
                    .file_store
                    .find_by_checksum(ctx.project_id, &checksum, file_to_update.id)
                    .await?
                {
                    // Identical payload already stored: point this row at it
                    // and drop the freshly uploaded bytes.
                    self.engine
                        .file_store
                        .update_file_uses(&file_to_update, &existing.uuid, existing.id)
                        .await?;

                    if let Err(e) = self.engine.byte_store.remove(&file_to_update.uuid) {
                        tracing::error!(
                            "Failed to delete deduplicated payload {}: {}",
                            file_to_update.uuid,
                            e
                        );
                    }
                    return Ok::<bool, BridgeError>(false);
                }
            }

            Ok(true)
        });

        match result {
            Ok(request_convert) => {
                if request_convert {
                    self.spawn_convert_request(&file_to_update);
                }
                reply.ok();
            }
            Err(e) => {
                tracing::error!("release {} failed: {}", vpath, e);
                reply.error(error_to_errno(&e));
            }
        }
    }

    // Project files are append-/version-only through the bridge: no
    // removals, no renames.
    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EPERM);
    }
}
