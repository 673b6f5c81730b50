//! Wire protocol definitions shared by the file server and the FUSE client.
//!
//! A request is `{length, opcode, fields...}`; a reply is `{length, status,
//! fields...}`. The leading length counts itself, so for every packet the
//! first four bytes decode to the total serialized size. Opcode values are
//! ABI: peers of different versions must agree on them, so they are never
//! reordered.

use std::io;
use std::time::Duration;

use num_enum::TryFromPrimitive;

use crate::xdr::{Decoder, Encoder, XDR_UNIT};

/// TCP port the terminal file server listens on.
pub const SERVER_PORT: u16 = 9220;
/// TCP port the device announcer listens on.
pub const LBUS_PORT: u16 = 9202;

/// Longest path accepted on the wire, matching the terminal's `PATH_MAX`.
pub const PATH_MAX: usize = 4096;

/// Largest legal packet. Sized for the two-path symlink request: one unit for
/// the length, one for the opcode, and a unit-plus-`PATH_MAX` per path.
pub const MAX_PACKET: usize = 4 * XDR_UNIT + 2 * PATH_MAX;

/// Smallest legal packet: a length and one more unit (opcode or status).
pub const MIN_PACKET: usize = 2 * XDR_UNIT;

/// Upper bound on a single READ/WRITE raw payload.
pub const MAX_IO_SIZE: usize = 8 << 20;

/// Timeout applied to reads and writes on an active request.
pub const LTSPFS_TIMEOUT: Duration = Duration::from_secs(120);
/// Idle wait between requests on the server, driving automatic unmount.
pub const AUTOMOUNT_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between client keepalive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Fail = 1,
    Cont = 2,
}

/// Filesystem operation selectors. The integer values are part of the wire
/// ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum Opcode {
    Getattr = 0,
    Readlink = 1,
    Readdir = 2,
    Mknod = 3,
    Mkdir = 4,
    Symlink = 5,
    Unlink = 6,
    Rmdir = 7,
    Rename = 8,
    Link = 9,
    Chmod = 10,
    Chown = 11,
    Truncate = 12,
    Utime = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Rsync = 19,
    Setxattr = 20,
    Getxattr = 21,
    Listxattr = 22,
    Removexattr = 23,
    Xauth = 24,
    Mount = 25,
    Ping = 26,
    Quit = 27,
}

/// Outgoing packet under construction. A placeholder length is written up
/// front and patched by [`PacketBuf::finish`].
#[derive(Debug)]
pub struct PacketBuf {
    enc: Encoder,
}

impl PacketBuf {
    /// Start a packet with just the length placeholder (reply form).
    pub fn new() -> Self {
        let mut enc = Encoder::with_capacity(64);
        enc.put_u32(0);
        Self { enc }
    }

    /// Start a request packet: placeholder plus opcode.
    pub fn request(op: Opcode) -> Self {
        let mut pkt = Self::new();
        pkt.enc.put_i32(op as i32);
        pkt
    }

    /// Start a reply packet: placeholder plus status.
    pub fn reply(status: Status) -> Self {
        let mut pkt = Self::new();
        pkt.enc.put_i32(status as i32);
        pkt
    }

    pub fn enc(&mut self) -> &mut Encoder {
        &mut self.enc
    }

    /// Patch the real length into the placeholder and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.enc.len() as u32;
        self.enc.overwrite_u32(0, len);
        self.enc.into_vec()
    }
}

impl Default for PacketBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Status-only OK reply.
pub fn status_ok() -> Vec<u8> {
    PacketBuf::reply(Status::Ok).finish()
}

/// Status-plus-errno failure reply.
pub fn status_fail(errno: i32) -> Vec<u8> {
    let mut pkt = PacketBuf::reply(Status::Fail);
    pkt.enc().put_i32(errno);
    pkt.finish()
}

/// Decoder positioned past the length prefix of a complete packet.
pub fn packet_decoder(pkt: &[u8]) -> io::Result<Decoder<'_>> {
    let mut dec = Decoder::new(pkt);
    let len = dec.get_u32()? as usize;
    if len != pkt.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "packet length prefix does not match packet size",
        ));
    }
    Ok(dec)
}

/// `lstat` result as carried inside a GETATTR reply. Field order and widths
/// are fixed by the protocol; the three timestamps and the block size travel
/// as 32-bit longs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.dev);
        enc.put_u64(self.ino);
        enc.put_u32(self.mode);
        enc.put_u32(self.nlink);
        enc.put_u32(self.uid);
        enc.put_u32(self.gid);
        enc.put_u64(self.rdev);
        enc.put_i64(self.size);
        enc.put_long(self.blksize);
        enc.put_i64(self.blocks);
        enc.put_long(self.atime);
        enc.put_long(self.mtime);
        enc.put_long(self.ctime);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> io::Result<Self> {
        Ok(Self {
            dev: dec.get_u64()?,
            ino: dec.get_u64()?,
            mode: dec.get_u32()?,
            nlink: dec.get_u32()?,
            uid: dec.get_u32()?,
            gid: dec.get_u32()?,
            rdev: dec.get_u64()?,
            size: dec.get_i64()?,
            blksize: dec.get_long()?,
            blocks: dec.get_i64()?,
            atime: dec.get_long()?,
            mtime: dec.get_long()?,
            ctime: dec.get_long()?,
        })
    }
}

/// `statfs` result as carried inside a STATFS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStat {
    pub fs_type: i32,
    pub bsize: i32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: i32,
}

impl FsStat {
    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_i32(self.fs_type);
        enc.put_i32(self.bsize);
        enc.put_u64(self.blocks);
        enc.put_u64(self.bfree);
        enc.put_u64(self.bavail);
        enc.put_u64(self.files);
        enc.put_u64(self.ffree);
        enc.put_i32(self.namelen);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> io::Result<Self> {
        Ok(Self {
            fs_type: dec.get_i32()?,
            bsize: dec.get_i32()?,
            blocks: dec.get_u64()?,
            bfree: dec.get_u64()?,
            bavail: dec.get_u64()?,
            files: dec.get_u64()?,
            ffree: dec.get_u64()?,
            namelen: dec.get_i32()?,
        })
    }
}

/// One directory entry inside a READDIR `CONT` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDirent {
    pub ino: u64,
    /// `d_type` byte, one of the `DT_*` constants.
    pub kind: u8,
    pub name: Vec<u8>,
}

impl WireDirent {
    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.ino);
        enc.put_u8(self.kind);
        enc.put_bytes(&self.name);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> io::Result<Self> {
        Ok(Self {
            ino: dec.get_u64()?,
            kind: dec.get_u8()?,
            name: dec.get_bytes(PATH_MAX)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_equals_packet_size() {
        let mut pkt = PacketBuf::request(Opcode::Chmod);
        pkt.enc().put_u32(0o644);
        pkt.enc().put_bytes(b"/f");
        let bytes = pkt.finish();
        let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(prefix as usize, bytes.len());

        for reply in [status_ok(), status_fail(libc::ENOENT)] {
            let prefix = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
            assert_eq!(prefix as usize, reply.len());
        }
    }

    #[test]
    fn opcode_values_are_abi() {
        assert_eq!(Opcode::Getattr as i32, 0);
        assert_eq!(Opcode::Write as i32, 16);
        assert_eq!(Opcode::Xauth as i32, 24);
        assert_eq!(Opcode::Quit as i32, 27);
        assert_eq!(Opcode::try_from(25).unwrap(), Opcode::Mount);
        assert!(Opcode::try_from(28).is_err());
    }

    #[test]
    fn request_encode_decodes_symmetrically() {
        let mut pkt = PacketBuf::request(Opcode::Read);
        pkt.enc().put_u32(8192);
        pkt.enc().put_i64(65536);
        pkt.enc().put_bytes(b"/photos/img.jpg");
        let bytes = pkt.finish();

        let mut dec = packet_decoder(&bytes).unwrap();
        assert_eq!(Opcode::try_from(dec.get_i32().unwrap()).unwrap(), Opcode::Read);
        assert_eq!(dec.get_u32().unwrap(), 8192);
        assert_eq!(dec.get_i64().unwrap(), 65536);
        assert_eq!(dec.get_bytes(PATH_MAX).unwrap(), b"/photos/img.jpg");
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn stat_record_round_trips() {
        let st = FileStat {
            dev: 0x801,
            ino: 42,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 5,
            blksize: 4096,
            blocks: 8,
            atime: 1_136_239_445,
            mtime: 1_136_239_445,
            ctime: 1_136_239_446,
        };
        let mut enc = Encoder::new();
        st.encode(&mut enc);
        let buf = enc.into_vec();
        // 2x u64 + 4x u32 + u64 + i64 + long + i64 + 3x long
        assert_eq!(buf.len(), 72);
        let back = FileStat::decode(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(back, st);
    }

    #[test]
    fn mismatched_length_prefix_is_rejected() {
        let mut pkt = status_ok();
        pkt.push(0);
        assert!(packet_decoder(&pkt).is_err());
    }
}
