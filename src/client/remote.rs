//! Wire-level operations against the terminal file server.
//!
//! All methods share one socket guarded by a mutex. Each request/reply pair,
//! including any raw payload that precedes or follows the reply packet,
//! happens under a single lock acquisition, so replies are unambiguously
//! matched to requests without sequence numbers. FUSE calls these from many
//! kernel threads at once; the lock is the whole concurrency story.

use std::io;
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::RpcError;
use crate::net;
use crate::wire::{
    self, FileStat, FsStat, Opcode, PacketBuf, Status, WireDirent, LTSPFS_TIMEOUT, PATH_MAX,
};
use crate::xdr::Decoder;

/// Shared handle to the server connection. Cheap to clone; all clones
/// serialize on the same mutex.
#[derive(Debug, Clone)]
pub struct RemoteFs {
    stream: Arc<Mutex<TcpStream>>,
}

fn bad_reply(what: &str) -> RpcError {
    RpcError::Transport(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}

impl RemoteFs {
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream. Used by the loopback tests.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    fn put_path(pkt: &mut PacketBuf, path: &Path) {
        pkt.enc().put_bytes(path.as_os_str().as_bytes());
    }

    /// One request, one reply packet, under the lock.
    fn call(&self, req: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let mut stream = self.stream.lock();
        net::write_all_timeout(&mut *stream, &req, LTSPFS_TIMEOUT)?;
        Self::read_reply(&mut stream)
    }

    fn read_reply(stream: &mut TcpStream) -> Result<Vec<u8>, RpcError> {
        net::read_packet(stream, LTSPFS_TIMEOUT)?
            .ok_or_else(|| RpcError::Transport(io::ErrorKind::UnexpectedEof.into()))
    }

    /// Check a reply's status and position the decoder at the record fields.
    fn parse_status<'a>(reply: &'a [u8]) -> Result<Decoder<'a>, RpcError> {
        let mut dec = wire::packet_decoder(reply).map_err(RpcError::Transport)?;
        let status = dec.get_i32().map_err(RpcError::Transport)?;
        match Status::try_from(status) {
            Ok(Status::Ok) => Ok(dec),
            Ok(Status::Fail) => Err(RpcError::Errno(dec.get_i32().unwrap_or(libc::EACCES))),
            _ => Err(bad_reply("unexpected reply status")),
        }
    }

    fn simple(&self, req: Vec<u8>) -> Result<(), RpcError> {
        let reply = self.call(req)?;
        Self::parse_status(&reply).map(drop)
    }

    /// Send a pre-built request and parse the status-only reply. For
    /// protocol tooling and tests; regular callers use the typed methods.
    pub fn raw_call(&self, req: Vec<u8>) -> Result<(), RpcError> {
        self.simple(req)
    }

    /// Send the X authority ticket. The raw bytes follow the packet before
    /// the reply is read, all under the one lock hold.
    pub fn send_xauth(&self, cookie: &[u8]) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Xauth);
        pkt.enc().put_u32(cookie.len() as u32);
        let req = pkt.finish();

        let reply = {
            let mut stream = self.stream.lock();
            net::write_all_timeout(&mut *stream, &req, LTSPFS_TIMEOUT)?;
            net::write_all_timeout(&mut *stream, cookie, LTSPFS_TIMEOUT)?;
            Self::read_reply(&mut stream)?
        };
        Self::parse_status(&reply).map(drop)
    }

    /// Bind the remote directory this session will serve.
    pub fn mount(&self, remote_dir: &Path) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Mount);
        Self::put_path(&mut pkt, remote_dir);
        self.simple(pkt.finish())
    }

    pub fn getattr(&self, path: &Path) -> Result<FileStat, RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Getattr);
        Self::put_path(&mut pkt, path);
        let reply = self.call(pkt.finish())?;
        let mut dec = Self::parse_status(&reply)?;
        FileStat::decode(&mut dec).map_err(RpcError::Transport)
    }

    pub fn readlink(&self, path: &Path) -> Result<Vec<u8>, RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Readlink);
        Self::put_path(&mut pkt, path);
        let reply = self.call(pkt.finish())?;
        let mut dec = Self::parse_status(&reply)?;
        dec.get_bytes(PATH_MAX).map_err(RpcError::Transport)
    }

    /// Fetch the whole directory stream. The `CONT` records are always
    /// drained to the terminating status so the connection never ends up
    /// mid-stream, whatever the caller does with the entries.
    pub fn readdir(&self, path: &Path) -> Result<Vec<WireDirent>, RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Readdir);
        Self::put_path(&mut pkt, path);
        let req = pkt.finish();

        let mut entries = Vec::new();
        let mut stream = self.stream.lock();
        net::write_all_timeout(&mut *stream, &req, LTSPFS_TIMEOUT)?;
        loop {
            let reply = Self::read_reply(&mut stream)?;
            let mut dec = wire::packet_decoder(&reply).map_err(RpcError::Transport)?;
            let status = Status::try_from(dec.get_i32().map_err(RpcError::Transport)?)
                .map_err(|_| bad_reply("unexpected readdir status"))?;
            match status {
                Status::Cont => {
                    entries.push(WireDirent::decode(&mut dec).map_err(RpcError::Transport)?);
                }
                Status::Ok => return Ok(entries),
                Status::Fail => {
                    return Err(RpcError::Errno(dec.get_i32().unwrap_or(libc::EACCES)));
                }
            }
        }
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Mknod);
        pkt.enc().put_u32(mode);
        pkt.enc().put_u64(rdev);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Mkdir);
        pkt.enc().put_u32(mode);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    /// `target` is what the new link points at, `link` is where it lives.
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<(), RpcError> {
        self.twopath(Opcode::Symlink, target, link)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<(), RpcError> {
        self.twopath(Opcode::Rename, from, to)
    }

    pub fn link(&self, from: &Path, to: &Path) -> Result<(), RpcError> {
        self.twopath(Opcode::Link, from, to)
    }

    fn twopath(&self, op: Opcode, from: &Path, to: &Path) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(op);
        Self::put_path(&mut pkt, from);
        Self::put_path(&mut pkt, to);
        self.simple(pkt.finish())
    }

    pub fn unlink(&self, path: &Path) -> Result<(), RpcError> {
        self.onepath(Opcode::Unlink, path)
    }

    pub fn rmdir(&self, path: &Path) -> Result<(), RpcError> {
        self.onepath(Opcode::Rmdir, path)
    }

    fn onepath(&self, op: Opcode, path: &Path) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(op);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Chmod);
        pkt.enc().put_u32(mode);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    /// `u32::MAX` for either id leaves it unchanged, as with chown(2).
    pub fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Chown);
        pkt.enc().put_u32(uid);
        pkt.enc().put_u32(gid);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    pub fn truncate(&self, path: &Path, size: i64) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Truncate);
        pkt.enc().put_i64(size);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    pub fn utime(&self, path: &Path, atime: i64, mtime: i64) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Utime);
        pkt.enc().put_long(atime);
        pkt.enc().put_long(mtime);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    pub fn open(&self, path: &Path, flags: i32) -> Result<(), RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Open);
        pkt.enc().put_i32(flags);
        Self::put_path(&mut pkt, path);
        self.simple(pkt.finish())
    }

    pub fn read(&self, path: &Path, size: u32, offset: i64) -> Result<Vec<u8>, RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Read);
        pkt.enc().put_u32(size);
        pkt.enc().put_i64(offset);
        Self::put_path(&mut pkt, path);
        let req = pkt.finish();

        let mut stream = self.stream.lock();
        net::write_all_timeout(&mut *stream, &req, LTSPFS_TIMEOUT)?;
        let reply = Self::read_reply(&mut stream)?;
        let mut dec = Self::parse_status(&reply)?;
        let returned = dec.get_i32().map_err(RpcError::Transport)?;
        if returned < 0 || returned as u32 > size {
            return Err(bad_reply("read size out of bounds"));
        }
        // The raw payload follows the reply packet on the same stream.
        let mut data = vec![0u8; returned as usize];
        net::read_exact_timeout(&mut *stream, &mut data, LTSPFS_TIMEOUT)?;
        Ok(data)
    }

    pub fn write(&self, path: &Path, offset: i64, data: &[u8]) -> Result<u32, RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Write);
        pkt.enc().put_u32(data.len() as u32);
        pkt.enc().put_i64(offset);
        Self::put_path(&mut pkt, path);
        let req = pkt.finish();

        let reply = {
            let mut stream = self.stream.lock();
            net::write_all_timeout(&mut *stream, &req, LTSPFS_TIMEOUT)?;
            net::write_all_timeout(&mut *stream, data, LTSPFS_TIMEOUT)?;
            Self::read_reply(&mut stream)?
        };
        let mut dec = Self::parse_status(&reply)?;
        let written = dec.get_i32().map_err(RpcError::Transport)?;
        if written < 0 {
            return Err(bad_reply("negative write count"));
        }
        Ok(written as u32)
    }

    pub fn statfs(&self, path: &Path) -> Result<FsStat, RpcError> {
        let mut pkt = PacketBuf::request(Opcode::Statfs);
        Self::put_path(&mut pkt, path);
        let reply = self.call(pkt.finish())?;
        let mut dec = Self::parse_status(&reply)?;
        FsStat::decode(&mut dec).map_err(RpcError::Transport)
    }

    pub fn ping(&self) -> Result<(), RpcError> {
        self.simple(PacketBuf::request(Opcode::Ping).finish())
    }

    /// Tell the server to end the session. Fire and forget: there is no
    /// reply, and the socket is about to go away anyway.
    pub fn quit(&self) {
        let req = PacketBuf::request(Opcode::Quit).finish();
        let mut stream = self.stream.lock();
        let _ = net::write_all_timeout(&mut *stream, &req, LTSPFS_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::status_fail;

    #[test]
    fn ok_reply_yields_a_decoder_at_the_record() {
        let mut pkt = PacketBuf::reply(Status::Ok);
        pkt.enc().put_i32(42);
        let reply = pkt.finish();
        let mut dec = RemoteFs::parse_status(&reply).unwrap();
        assert_eq!(dec.get_i32().unwrap(), 42);
    }

    #[test]
    fn fail_reply_carries_the_remote_errno() {
        let reply = status_fail(libc::ENOENT);
        match RemoteFs::parse_status(&reply) {
            Err(RpcError::Errno(errno)) => assert_eq!(errno, libc::ENOENT),
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn fail_reply_without_an_errno_defaults_to_eacces() {
        let reply = PacketBuf::reply(Status::Fail).finish();
        match RemoteFs::parse_status(&reply) {
            Err(RpcError::Errno(errno)) => assert_eq!(errno, libc::EACCES),
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_status_is_a_transport_error() {
        let mut pkt = PacketBuf::new();
        pkt.enc().put_i32(9);
        let reply = pkt.finish();
        assert!(matches!(
            RemoteFs::parse_status(&reply),
            Err(RpcError::Transport(_))
        ));
    }
}
