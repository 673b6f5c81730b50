//! XDR scalar and string codec.
//!
//! The wire protocol frames every field the way a standard XDR library does:
//! big-endian scalars occupying whole 4-byte units, and strings carried as a
//! length followed by the bytes, zero-padded up to the next unit boundary.
//! Two quirks of glibc's encoder are load-bearing for compatibility and are
//! reproduced here: `long` travels as a single 32-bit unit regardless of the
//! host width, and `u8` occupies a full unit.

use std::io;

/// Size of one XDR unit in bytes. Every encoded field is a multiple of this.
pub const XDR_UNIT: usize = 4;

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated XDR field")
}

/// Append-only XDR encoder over a growable buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Encode a C `long` the way `xdr_long` does: one 32-bit unit.
    pub fn put_long(&mut self, v: i64) {
        self.put_i32(v as i32);
    }

    /// Encode a byte the way `xdr_u_char` does: one full unit.
    pub fn put_u8(&mut self, v: u8) {
        self.put_u32(u32::from(v));
    }

    /// Length-prefixed string, zero-padded to a unit boundary.
    pub fn put_bytes(&mut self, s: &[u8]) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s);
        let pad = (XDR_UNIT - s.len() % XDR_UNIT) % XDR_UNIT;
        self.buf.extend_from_slice(&[0u8; XDR_UNIT][..pad]);
    }

    /// Patch a previously written unit in place. Used to fix up the packet
    /// length placeholder once the payload is complete.
    pub fn overwrite_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + XDR_UNIT].copy_from_slice(&v.to_be_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based XDR decoder over a borrowed packet.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(truncated());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn unit(&mut self) -> io::Result<[u8; XDR_UNIT]> {
        let raw = self.take(XDR_UNIT)?;
        let mut out = [0u8; XDR_UNIT];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn get_u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_be_bytes(self.unit()?))
    }

    pub fn get_i32(&mut self) -> io::Result<i32> {
        Ok(i32::from_be_bytes(self.unit()?))
    }

    pub fn get_u64(&mut self) -> io::Result<u64> {
        let raw = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_be_bytes(out))
    }

    pub fn get_i64(&mut self) -> io::Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    /// Decode a 32-bit on-wire `long`, sign-extending to the host width.
    pub fn get_long(&mut self) -> io::Result<i64> {
        Ok(i64::from(self.get_i32()?))
    }

    pub fn get_u8(&mut self) -> io::Result<u8> {
        Ok(self.get_u32()? as u8)
    }

    /// Decode a length-prefixed string of at most `max` bytes, consuming the
    /// padding. An overlong length is an error so callers can refuse paths
    /// that would no longer fit once the mountpoint is prepended.
    pub fn get_bytes(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "XDR string exceeds limit",
            ));
        }
        let data = self.take(len)?.to_vec();
        let pad = (XDR_UNIT - len % XDR_UNIT) % XDR_UNIT;
        self.take(pad)?;
        Ok(data)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_layout_matches_xdr() {
        let mut enc = Encoder::new();
        enc.put_u32(1);
        enc.put_i32(-2);
        enc.put_u8(0x7f);
        enc.put_long(-1);
        assert_eq!(
            enc.as_slice(),
            [
                0, 0, 0, 1, // u32
                0xff, 0xff, 0xff, 0xfe, // i32
                0, 0, 0, 0x7f, // u_char widened to a unit
                0xff, 0xff, 0xff, 0xff, // long truncated to 32 bits
            ]
        );
    }

    #[test]
    fn string_is_length_prefixed_and_padded() {
        let mut enc = Encoder::new();
        enc.put_bytes(b"abcde");
        assert_eq!(enc.as_slice(), [0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0]);

        let mut enc = Encoder::new();
        enc.put_bytes(b"abcd");
        assert_eq!(enc.len(), 8); // exact multiple gets no padding
    }

    #[test]
    fn decode_round_trips_scalars() {
        let mut enc = Encoder::new();
        enc.put_u64(0xdead_beef_0102_0304);
        enc.put_i64(-5);
        enc.put_long(i64::from(i32::MIN));
        enc.put_bytes(b"/media/usb0");
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.get_u64().unwrap(), 0xdead_beef_0102_0304);
        assert_eq!(dec.get_i64().unwrap(), -5);
        assert_eq!(dec.get_long().unwrap(), i64::from(i32::MIN));
        assert_eq!(dec.get_bytes(4096).unwrap(), b"/media/usb0");
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn overlong_string_is_refused() {
        let mut enc = Encoder::new();
        enc.put_bytes(b"abcdef");
        let buf = enc.into_vec();
        assert!(Decoder::new(&buf).get_bytes(5).is_err());
    }

    #[test]
    fn truncated_field_is_an_error() {
        let buf = [0u8, 0, 0];
        assert!(Decoder::new(&buf).get_u32().is_err());
    }
}
