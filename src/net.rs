//! Blocking socket I/O with readiness timeouts.
//!
//! Both peers move whole packets at a time over a blocking TCP stream, but
//! every read and write is bounded: each iteration of the partial-I/O loop
//! first waits for readiness with `poll(2)` and gives up after the supplied
//! timeout. A timeout surfaces as [`io::ErrorKind::TimedOut`] and peer EOF in
//! the middle of a packet as [`io::ErrorKind::UnexpectedEof`]; the caller
//! decides whether that kills a server worker or unmounts the client.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::wire::{MAX_PACKET, MIN_PACKET};
use crate::xdr::{Decoder, XDR_UNIT};

fn poll_wait<F: AsFd>(io: &F, events: PollFlags, timeout: Duration) -> io::Result<bool> {
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    loop {
        let mut fds = [PollFd::new(io.as_fd(), events)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wait for the descriptor to become readable. `Ok(false)` means the wait
/// timed out with nothing to read.
pub fn wait_readable<F: AsFd>(io: &F, timeout: Duration) -> io::Result<bool> {
    poll_wait(io, PollFlags::POLLIN, timeout)
}

/// Read exactly `buf.len()` bytes, polling before every `read`.
pub fn read_exact_timeout<F: Read + AsFd>(
    io: &mut F,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if !poll_wait(io, PollFlags::POLLIN, timeout)? {
            return Err(io::ErrorKind::TimedOut.into());
        }
        match io.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write the whole buffer, polling before every `write`.
pub fn write_all_timeout<F: Write + AsFd>(
    io: &mut F,
    buf: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        if !poll_wait(io, PollFlags::POLLOUT, timeout)? {
            return Err(io::ErrorKind::TimedOut.into());
        }
        match io.write(&buf[sent..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read one complete length-prefixed packet, tolerating arbitrary `recv`
/// fragmentation. Returns `Ok(None)` on a clean EOF before the first byte,
/// which is how a peer hangs up between requests.
pub fn read_packet<F: Read + AsFd>(
    io: &mut F,
    timeout: Duration,
) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; XDR_UNIT];
    let mut filled = 0;
    while filled < len_buf.len() {
        if !poll_wait(io, PollFlags::POLLIN, timeout)? {
            return Err(io::ErrorKind::TimedOut.into());
        }
        match io.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let len = Decoder::new(&len_buf).get_u32()? as usize;
    if !(MIN_PACKET..=MAX_PACKET).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet length {len} outside protocol bounds"),
        ));
    }

    let mut pkt = vec![0u8; len];
    pkt[..XDR_UNIT].copy_from_slice(&len_buf);
    read_exact_timeout(io, &mut pkt[XDR_UNIT..], timeout)?;
    Ok(Some(pkt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, Opcode, PacketBuf};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn packet_survives_fragmented_delivery() {
        let (mut a, mut b) = pair();
        let mut pkt = PacketBuf::request(Opcode::Mount);
        pkt.enc().put_bytes(b"/media/usb0");
        let bytes = pkt.finish();

        let writer = thread::spawn(move || {
            for chunk in bytes.chunks(3) {
                a.write_all(chunk).unwrap();
                a.flush().unwrap();
            }
            bytes
        });

        let got = read_packet(&mut b, Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(got, writer.join().unwrap());
    }

    #[test]
    fn clean_eof_between_packets_is_none() {
        let (a, mut b) = pair();
        drop(a);
        assert!(read_packet(&mut b, Duration::from_secs(5)).unwrap().is_none());
    }

    #[test]
    fn eof_inside_packet_is_an_error() {
        let (mut a, mut b) = pair();
        // A plausible length, then nothing.
        a.write_all(&20u32.to_be_bytes()).unwrap();
        drop(a);
        let err = read_packet(&mut b, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn absurd_length_prefix_is_rejected() {
        let (mut a, mut b) = pair();
        a.write_all(&(wire::MAX_PACKET as u32 + 1).to_be_bytes()).unwrap();
        let err = read_packet(&mut b, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn idle_read_times_out() {
        let (_a, mut b) = pair();
        let err = read_packet(&mut b, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
