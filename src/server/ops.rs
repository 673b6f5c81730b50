//! Filesystem operation handlers.
//!
//! Each handler decodes its operation-specific fields, performs the local
//! syscall against the joined path, and replies. The server keeps no file
//! handles: OPEN is only an access probe, and READ/WRITE re-open the file on
//! every request, so a worker carries no state beyond its session.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirEntryExt, FileExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use log::{debug, warn};
use nix::sys::stat::{mknod, utimes, Mode, SFlag};
use nix::sys::time::TimeVal;
use nix::unistd::{chown, mkdir, truncate, Gid, Uid};

use crate::net;
use crate::server::session::Session;
use crate::wire::{
    self, FileStat, FsStat, Opcode, PacketBuf, Status, WireDirent, LTSPFS_TIMEOUT, MAX_IO_SIZE,
};
use crate::xdr::Decoder;

fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn stat_of(meta: &fs::Metadata) -> FileStat {
    FileStat {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size() as i64,
        blksize: meta.blksize() as i64,
        blocks: meta.blocks() as i64,
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
    }
}

fn dt_of(ft: fs::FileType) -> u8 {
    if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_file() {
        libc::DT_REG
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else if ft.is_fifo() {
        libc::DT_FIFO
    } else if ft.is_char_device() {
        libc::DT_CHR
    } else if ft.is_block_device() {
        libc::DT_BLK
    } else if ft.is_socket() {
        libc::DT_SOCK
    } else {
        libc::DT_UNKNOWN
    }
}

impl Session {
    pub(crate) fn handle_op(
        &mut self,
        op: Opcode,
        dec: &mut Decoder<'_>,
        mountpoint: &Path,
    ) -> io::Result<()> {
        match op {
            Opcode::Getattr => self.op_getattr(dec, mountpoint),
            Opcode::Readlink => self.op_readlink(dec, mountpoint),
            Opcode::Readdir => self.op_readdir(dec, mountpoint),
            Opcode::Mknod => self.op_mknod(dec, mountpoint),
            Opcode::Mkdir => self.op_mkdir(dec, mountpoint),
            Opcode::Symlink => self.op_twopath(op, dec, mountpoint),
            Opcode::Unlink => self.op_onepath(op, dec, mountpoint),
            Opcode::Rmdir => self.op_onepath(op, dec, mountpoint),
            Opcode::Rename => self.op_twopath(op, dec, mountpoint),
            Opcode::Link => self.op_twopath(op, dec, mountpoint),
            Opcode::Chmod => self.op_chmod(dec, mountpoint),
            Opcode::Chown => self.op_chown(dec, mountpoint),
            Opcode::Truncate => self.op_truncate(dec, mountpoint),
            Opcode::Utime => self.op_utime(dec, mountpoint),
            Opcode::Open => self.op_open(dec, mountpoint),
            Opcode::Read => self.op_read(dec, mountpoint),
            Opcode::Write => self.op_write(dec, mountpoint),
            Opcode::Statfs => self.op_statfs(dec, mountpoint),
            Opcode::Release
            | Opcode::Rsync
            | Opcode::Setxattr
            | Opcode::Getxattr
            | Opcode::Listxattr
            | Opcode::Removexattr => self.send(&wire::status_fail(libc::ENOSYS)),
            // Gated earlier in the session state machine.
            Opcode::Xauth | Opcode::Mount | Opcode::Ping | Opcode::Quit => {
                self.send(&wire::status_fail(libc::EACCES))
            }
        }
    }

    fn status(&mut self, res: Result<(), i32>) -> io::Result<()> {
        match res {
            Ok(()) => self.send(&wire::status_ok()),
            Err(errno) => self.send(&wire::status_fail(errno)),
        }
    }

    fn op_getattr(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        match fs::symlink_metadata(&path) {
            Err(e) => self.status(Err(errno_of(&e))),
            Ok(meta) => {
                let mut pkt = PacketBuf::reply(Status::Ok);
                stat_of(&meta).encode(pkt.enc());
                self.send(&pkt.finish())
            }
        }
    }

    fn op_readlink(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        match fs::read_link(&path) {
            Err(e) => self.status(Err(errno_of(&e))),
            Ok(target) => {
                // A target inside the exported tree is reported relative to
                // it, so the other side sees its own namespace.
                let bytes = target.as_os_str().as_bytes();
                let prefix = mountpoint.as_os_str().as_bytes();
                let visible = bytes.strip_prefix(prefix).unwrap_or(bytes);
                let mut pkt = PacketBuf::reply(Status::Ok);
                pkt.enc().put_bytes(visible);
                self.send(&pkt.finish())
            }
        }
    }

    fn op_readdir(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        let entries = match fs::read_dir(&path) {
            Err(e) => return self.status(Err(errno_of(&e))),
            Ok(entries) => entries,
        };

        if let Ok(meta) = fs::metadata(&path) {
            self.send_dirent(&WireDirent {
                ino: meta.ino(),
                kind: libc::DT_DIR,
                name: b".".to_vec(),
            })?;
        }
        if let Ok(meta) = fs::metadata(path.join("..")) {
            self.send_dirent(&WireDirent {
                ino: meta.ino(),
                kind: libc::DT_DIR,
                name: b"..".to_vec(),
            })?;
        }

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("readdir on {}: {e}", path.display());
                    continue;
                }
            };
            let kind = entry.file_type().map(dt_of).unwrap_or(libc::DT_UNKNOWN);
            self.send_dirent(&WireDirent {
                ino: entry.ino(),
                kind,
                name: entry.file_name().as_bytes().to_vec(),
            })?;
        }

        self.send(&wire::status_ok())
    }

    fn send_dirent(&mut self, dirent: &WireDirent) -> io::Result<()> {
        let mut pkt = PacketBuf::reply(Status::Cont);
        dirent.encode(pkt.enc());
        self.send(&pkt.finish())
    }

    fn op_mknod(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let mode = dec.get_u32()?;
        let rdev = dec.get_u64()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = mknod(
            &path,
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            rdev as libc::dev_t,
        );
        self.status(res.map_err(|e| e as i32))
    }

    fn op_mkdir(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let mode = dec.get_u32()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = mkdir(&path, Mode::from_bits_truncate(mode));
        self.status(res.map_err(|e| e as i32))
    }

    fn op_onepath(
        &mut self,
        op: Opcode,
        dec: &mut Decoder<'_>,
        mountpoint: &Path,
    ) -> io::Result<()> {
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = match op {
            Opcode::Unlink => fs::remove_file(&path),
            Opcode::Rmdir => fs::remove_dir(&path),
            _ => unreachable!("not a one-path mutator: {op:?}"),
        };
        self.status(res.map_err(|e| errno_of(&e)))
    }

    fn op_twopath(
        &mut self,
        op: Opcode,
        dec: &mut Decoder<'_>,
        mountpoint: &Path,
    ) -> io::Result<()> {
        let Some(from) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        let Some(to) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = match op {
            Opcode::Symlink => symlink(&from, &to),
            Opcode::Rename => fs::rename(&from, &to),
            Opcode::Link => fs::hard_link(&from, &to),
            _ => unreachable!("not a two-path mutator: {op:?}"),
        };
        self.status(res.map_err(|e| errno_of(&e)))
    }

    fn op_chmod(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let mode = dec.get_u32()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = fs::set_permissions(&path, Permissions::from_mode(mode));
        self.status(res.map_err(|e| errno_of(&e)))
    }

    fn op_chown(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let uid = dec.get_u32()?;
        let gid = dec.get_u32()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        // u32::MAX is "leave unchanged", same as chown(2).
        let res = chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
        self.status(res.map_err(|e| e as i32))
    }

    fn op_truncate(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let size = dec.get_i64()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = truncate(&path, size as libc::off_t);
        self.status(res.map_err(|e| e as i32))
    }

    fn op_utime(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let actime = dec.get_long()?;
        let modtime = dec.get_long()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }
        let res = utimes(
            &path,
            &TimeVal::new(actime as libc::time_t, 0),
            &TimeVal::new(modtime as libc::time_t, 0),
        );
        self.status(res.map_err(|e| e as i32))
    }

    fn op_open(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let flags = dec.get_i32()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if self.readonly() && (flags & libc::O_ACCMODE) != libc::O_RDONLY {
            return self.status(Err(libc::EACCES));
        }
        // Permission probe only; the descriptor is dropped immediately and
        // READ/WRITE re-open the file per request.
        let res = nix::fcntl::open(
            &path,
            nix::fcntl::OFlag::from_bits_truncate(flags),
            Mode::empty(),
        );
        self.status(res.map(drop).map_err(|e| e as i32))
    }

    fn op_read(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let size = dec.get_u32()? as usize;
        let offset = dec.get_i64()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if size > MAX_IO_SIZE {
            return self.status(Err(libc::EINVAL));
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => return self.status(Err(errno_of(&e))),
        };
        let mut buf = vec![0u8; size];
        let got = match file.read_at(&mut buf, offset as u64) {
            Ok(got) => got,
            Err(e) => return self.status(Err(errno_of(&e))),
        };

        let mut pkt = PacketBuf::reply(Status::Ok);
        pkt.enc().put_i32(got as i32);
        self.send(&pkt.finish())?;
        debug!("read {} of {} bytes from {}", got, size, path.display());
        net::write_all_timeout(self.stream(), &buf[..got], LTSPFS_TIMEOUT)
    }

    fn op_write(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let size = dec.get_u32()? as usize;
        let offset = dec.get_i64()?;
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        if size > MAX_IO_SIZE {
            // Nothing sane can be drained; refuse and drop the connection.
            self.status(Err(libc::EINVAL))?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "write payload exceeds protocol limit",
            ));
        }

        // The payload follows the packet unconditionally, so it must be
        // consumed before any failure reply or the stream desynchronizes.
        let mut buf = vec![0u8; size];
        net::read_exact_timeout(self.stream(), &mut buf, LTSPFS_TIMEOUT)?;

        if self.readonly() {
            return self.status(Err(libc::EACCES));
        }

        let file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(e) => return self.status(Err(errno_of(&e))),
        };
        match file.write_at(&buf, offset as u64) {
            Err(e) => self.status(Err(errno_of(&e))),
            Ok(written) => {
                debug!("wrote {} bytes to {}", written, path.display());
                let mut pkt = PacketBuf::reply(Status::Ok);
                pkt.enc().put_i32(written as i32);
                self.send(&pkt.finish())
            }
        }
    }

    fn op_statfs(&mut self, dec: &mut Decoder<'_>, mountpoint: &Path) -> io::Result<()> {
        let Some(path) = self.fs_path(dec, mountpoint)? else {
            return Ok(());
        };
        match nix::sys::statfs::statfs(&path) {
            Err(e) => self.status(Err(e as i32)),
            Ok(st) => {
                let record = FsStat {
                    fs_type: st.filesystem_type().0 as i32,
                    bsize: st.block_size() as i32,
                    blocks: st.blocks(),
                    bfree: st.blocks_free(),
                    bavail: st.blocks_available(),
                    files: st.files(),
                    ffree: st.files_free(),
                    namelen: st.maximum_name_length() as i32,
                };
                let mut pkt = PacketBuf::reply(Status::Ok);
                record.encode(pkt.enc());
                self.send(&pkt.finish())
            }
        }
    }
}
