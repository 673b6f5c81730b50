//! FUSE callback surface.
//!
//! The wire protocol is path-based while the kernel interface is
//! inode-based, so the adapter keeps a table mapping synthesized inode
//! numbers to remote paths, the same job libfuse's high-level layer performed
//! for the original daemon pair. Inode 1 is the share root; lookups assign
//! fresh numbers, renames re-key the affected subtree.
//!
//! Remote uid/gid are deliberately ignored: files always appear owned by the
//! user who mounted the share, whatever ids the medium carries.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, error};

use crate::client::{self, RemoteFs, RpcError};
use crate::wire::FileStat;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    inos: HashMap<PathBuf, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let root = PathBuf::from("/");
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, root.clone());
        inos.insert(root, ROOT_INO);
        Self {
            paths,
            inos,
            next: ROOT_INO + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn assign(&mut self, path: &Path) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.to_path_buf());
        self.inos.insert(path.to_path_buf(), ino);
        ino
    }

    fn forget_path(&mut self, path: &Path) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Re-key `from` and everything under it to live below `to`.
    fn rename(&mut self, from: &Path, to: &Path) {
        let moved: Vec<(PathBuf, u64)> = self
            .inos
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old_path, ino) in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            self.inos.remove(&old_path);
            // An overwritten destination keeps its stale inode entry in
            // `paths` only; the kernel re-looks-up before using it.
            if let Some(shadowed) = self.inos.remove(&new_path) {
                self.paths.remove(&shadowed);
            }
            self.inos.insert(new_path.clone(), ino);
            self.paths.insert(ino, new_path);
        }
    }
}

fn kind_of_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_of_dt(kind: u8) -> FileType {
    match kind {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn time_of(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn secs_of(time: TimeOrNow) -> i64 {
    let at = match time {
        TimeOrNow::SpecificTime(at) => at,
        TimeOrNow::Now => SystemTime::now(),
    };
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

fn attr_of(st: &FileStat, ino: u64, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: st.size as u64,
        blocks: st.blocks as u64,
        atime: time_of(st.atime),
        mtime: time_of(st.mtime),
        ctime: time_of(st.ctime),
        crtime: UNIX_EPOCH,
        kind: kind_of_mode(st.mode),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink,
        uid,
        gid,
        rdev: st.rdev as u32,
        blksize: st.blksize as u32,
        flags: 0,
    }
}

/// The mounted filesystem: remote connection plus inode bookkeeping.
#[derive(Debug)]
pub struct LtspFs {
    remote: RemoteFs,
    /// Local FUSE mount path, needed for emergency teardown.
    mountpoint: PathBuf,
    inodes: InodeTable,
}

impl LtspFs {
    pub fn new(remote: RemoteFs, mountpoint: PathBuf) -> Self {
        Self {
            remote,
            mountpoint,
            inodes: InodeTable::new(),
        }
    }

    /// Split an [`RpcError`] into the errno to hand the kernel. A transport
    /// failure means the terminal is unreachable; there is no useful reply,
    /// so the mount comes down and the process exits.
    fn errno(&self, err: RpcError) -> i32 {
        match err {
            RpcError::Errno(errno) => errno,
            RpcError::Transport(e) => {
                error!("connection to terminal lost: {e}");
                client::unmount_and_exit(&self.mountpoint);
            }
        }
    }

    fn require_path(&self, ino: u64) -> Result<PathBuf, i32> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }

    fn reply_entry(&mut self, req: &Request<'_>, path: &Path, reply: ReplyEntry) {
        match self.remote.getattr(path) {
            Ok(st) => {
                let ino = self.inodes.assign(path);
                reply.entry(&TTL, &attr_of(&st, ino, req.uid(), req.gid()), 0);
            }
            Err(e) => reply.error(self.errno(e)),
        }
    }
}

impl Filesystem for LtspFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.require_path(parent) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let path = parent_path.join(name);
        self.reply_entry(req, &path, reply);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.remote.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &attr_of(&st, ino, req.uid(), req.gid())),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        // The wire protocol carries each attribute change as its own
        // operation, the way the high-level FUSE API used to split them.
        let outcome = (|| -> Result<FileStat, RpcError> {
            if let Some(mode) = mode {
                self.remote.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.remote
                    .chown(&path, uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX))?;
            }
            if let Some(size) = size {
                self.remote.truncate(&path, size as i64)?;
            }
            if atime.is_some() || mtime.is_some() {
                let current = if atime.is_none() || mtime.is_none() {
                    Some(self.remote.getattr(&path)?)
                } else {
                    None
                };
                let atime = atime
                    .map(secs_of)
                    .or(current.map(|st| st.atime))
                    .unwrap_or_default();
                let mtime = mtime
                    .map(secs_of)
                    .or(current.map(|st| st.mtime))
                    .unwrap_or_default();
                self.remote.utime(&path, atime, mtime)?;
            }
            self.remote.getattr(&path)
        })();

        match outcome {
            Ok(st) => reply.attr(&TTL, &attr_of(&st, ino, req.uid(), req.gid())),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.remote.readlink(&path) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.require_path(parent) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let path = parent_path.join(name);
        match self.remote.mknod(&path, mode, u64::from(rdev)) {
            Ok(()) => self.reply_entry(req, &path, reply),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.require_path(parent) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let path = parent_path.join(name);
        match self.remote.mkdir(&path, mode) {
            Ok(()) => self.reply_entry(req, &path, reply),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.require_path(parent) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let path = parent_path.join(name);
        match self.remote.unlink(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.require_path(parent) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let path = parent_path.join(name);
        match self.remote.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.require_path(parent) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let link = parent_path.join(name);
        match self.remote.symlink(target, &link) {
            Ok(()) => self.reply_entry(req, &link, reply),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from_parent, to_parent) =
            match (self.require_path(parent), self.require_path(newparent)) {
                (Ok(from), Ok(to)) => (from, to),
                _ => return reply.error(libc::ENOENT),
            };
        let from = from_parent.join(name);
        let to = to_parent.join(newname);
        match self.remote.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (path, parent_path) = match (self.require_path(ino), self.require_path(newparent)) {
            (Ok(path), Ok(parent)) => (path, parent),
            _ => return reply.error(libc::ENOENT),
        };
        let new_path = parent_path.join(newname);
        match self.remote.link(&path, &new_path) {
            Ok(()) => self.reply_entry(req, &new_path, reply),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.remote.open(&path, flags) {
            // The server holds no handles, so there is nothing to number.
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.remote.read(&path, size, offset) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.remote.write(&path, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Stateless protocol: every WRITE already hit the terminal.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        // The stream is always drained in full; replaying from `offset`
        // keeps the kernel's paging honest even when its buffer fills.
        let entries = match self.remote.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(self.errno(e)),
        };
        for (idx, entry) in entries.iter().enumerate() {
            if (idx as i64) < offset {
                continue;
            }
            let name = OsStr::from_bytes(&entry.name);
            if reply.add(entry.ino, idx as i64 + 1, kind_of_dt(entry.kind), name) {
                debug!("readdir buffer full at {}", idx);
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = match self.require_path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.remote.statfs(&path) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                st.bsize as u32,
                st.namelen as u32,
                st.bsize as u32,
            ),
            Err(e) => reply.error(self.errno(e)),
        }
    }

    fn destroy(&mut self) {
        debug!("unmounted, telling the server to quit");
        self.remote.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_assigns_stably() {
        let mut table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).unwrap(), Path::new("/"));
        let a = table.assign(Path::new("/a"));
        let b = table.assign(Path::new("/b"));
        assert_ne!(a, b);
        assert_eq!(table.assign(Path::new("/a")), a);
        assert_eq!(table.path_of(a).unwrap(), Path::new("/a"));
    }

    #[test]
    fn rename_rekeys_the_subtree() {
        let mut table = InodeTable::new();
        let dir = table.assign(Path::new("/a"));
        let child = table.assign(Path::new("/a/x"));
        table.rename(Path::new("/a"), Path::new("/b"));
        assert_eq!(table.path_of(dir).unwrap(), Path::new("/b"));
        assert_eq!(table.path_of(child).unwrap(), Path::new("/b/x"));
        assert_eq!(table.assign(Path::new("/b/x")), child);
    }

    #[test]
    fn rename_over_existing_target_drops_the_shadowed_entry() {
        let mut table = InodeTable::new();
        let old = table.assign(Path::new("/a/x"));
        let shadowed = table.assign(Path::new("/b/x"));
        table.rename(Path::new("/a/x"), Path::new("/b/x"));
        assert_eq!(table.path_of(old).unwrap(), Path::new("/b/x"));
        assert!(table.path_of(shadowed).is_none());
        assert_eq!(table.assign(Path::new("/b/x")), old);
    }

    #[test]
    fn forget_path_clears_both_directions() {
        let mut table = InodeTable::new();
        let ino = table.assign(Path::new("/gone"));
        table.forget_path(Path::new("/gone"));
        assert!(table.path_of(ino).is_none());
        assert_ne!(table.assign(Path::new("/gone")), ino);
    }

    #[test]
    fn mode_maps_to_fuse_kind() {
        assert_eq!(kind_of_mode(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(kind_of_mode(libc::S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(kind_of_mode(libc::S_IFLNK | 0o777), FileType::Symlink);
    }

    #[test]
    fn negative_timestamps_survive() {
        assert_eq!(time_of(0), UNIX_EPOCH);
        assert!(time_of(-1) < UNIX_EPOCH);
        assert_eq!(
            time_of(1_136_239_445),
            UNIX_EPOCH + Duration::from_secs(1_136_239_445)
        );
    }
}
