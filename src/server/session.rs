//! Per-connection server session.
//!
//! A session walks a fixed state machine: unauthenticated, authenticated,
//! mountpoint bound, and (on demand) locally mounted. Only XAUTH is accepted
//! before authentication and only MOUNT before a mountpoint is bound; once
//! serving, every request path is joined under the mountpoint before any
//! syscall, and the join refuses `..` escapes.

use std::ffi::OsStr;
use std::io;
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, trace};

use crate::net;
use crate::server::{auth, automount, ServerConfig};
use crate::wire::{
    self, Opcode, AUTOMOUNT_TIMEOUT, LTSPFS_TIMEOUT, PATH_MAX,
};
use crate::xdr::Decoder;

/// Largest X authority ticket the server will buffer.
const MAX_AUTH_SIZE: usize = 64 * 1024;

/// Whether the session loop keeps serving after a request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Quit,
}

/// One connection's worth of server state.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    readonly: bool,
    skip_auth: bool,
    authenticated: bool,
    mountpoint: Option<PathBuf>,
    mounted: bool,
}

impl Session {
    pub fn new(stream: TcpStream, cfg: &ServerConfig) -> Self {
        Self {
            stream,
            readonly: cfg.readonly,
            skip_auth: cfg.skip_auth,
            authenticated: false,
            mountpoint: None,
            mounted: false,
        }
    }

    /// Serve the connection until the peer quits, hangs up, or a transport
    /// error makes the stream unusable.
    pub fn run(mut self) -> io::Result<()> {
        loop {
            if !net::wait_readable(&self.stream, AUTOMOUNT_TIMEOUT)? {
                // Idle between requests. Tear down the local mount so the
                // medium can be pulled, and keep waiting.
                if self.mounted {
                    if let Some(mp) = &self.mountpoint {
                        automount::unmount(mp);
                    }
                    self.mounted = false;
                }
                continue;
            }

            let pkt = match net::read_packet(&mut self.stream, LTSPFS_TIMEOUT)? {
                Some(pkt) => pkt,
                None => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
            };

            match self.dispatch(&pkt)? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    fn dispatch(&mut self, pkt: &[u8]) -> io::Result<Flow> {
        let mut dec = wire::packet_decoder(pkt)?;
        let op = Opcode::try_from(dec.get_i32()?).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad opcode: {e}"))
        })?;
        trace!("request {op:?}");

        if !self.authenticated {
            return match op {
                Opcode::Xauth => self.handle_auth(&mut dec),
                _ => {
                    debug!("{op:?} before authentication, closing");
                    self.send(&wire::status_fail(libc::EACCES))?;
                    Ok(Flow::Quit)
                }
            };
        }

        let mountpoint = match self.mountpoint.clone() {
            Some(mp) => mp,
            None => {
                return match op {
                    Opcode::Mount => self.handle_mount(&mut dec),
                    _ => {
                        debug!("{op:?} before mount");
                        self.send(&wire::status_fail(libc::EACCES))?;
                        Ok(Flow::Continue)
                    }
                }
            }
        };

        match op {
            Opcode::Ping => {
                self.send(&wire::status_ok())?;
                Ok(Flow::Continue)
            }
            Opcode::Quit => {
                debug!("peer quit");
                Ok(Flow::Quit)
            }
            _ => {
                if !self.mounted {
                    automount::mount(&mountpoint);
                    self.mounted = true;
                }
                self.handle_op(op, &mut dec, &mountpoint)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_auth(&mut self, dec: &mut Decoder<'_>) -> io::Result<Flow> {
        let size = dec.get_u32()? as usize;
        if size > MAX_AUTH_SIZE {
            self.send(&wire::status_fail(libc::EACCES))?;
            return Ok(Flow::Quit);
        }
        // The ticket follows the packet as raw bytes, like a WRITE payload.
        let mut cookie = vec![0u8; size];
        net::read_exact_timeout(&mut self.stream, &mut cookie, LTSPFS_TIMEOUT)?;

        if self.skip_auth {
            info!("authentication skipped (-a)");
        } else {
            let passed = match auth::verify_cookie(&cookie) {
                Ok(passed) => passed,
                Err(e) => {
                    info!("authentication setup failed: {e}");
                    false
                }
            };
            if !passed {
                info!("authentication refused");
                self.send(&wire::status_fail(libc::EACCES))?;
                return Ok(Flow::Quit);
            }
            info!("authentication passed");
        }

        self.authenticated = true;
        self.send(&wire::status_ok())?;
        Ok(Flow::Continue)
    }

    fn handle_mount(&mut self, dec: &mut Decoder<'_>) -> io::Result<Flow> {
        let raw = match dec.get_bytes(PATH_MAX) {
            Ok(raw) => raw,
            Err(_) => {
                self.send(&wire::status_fail(libc::EACCES))?;
                return Ok(Flow::Continue);
            }
        };
        let mountpoint = PathBuf::from(OsStr::from_bytes(&raw));
        info!("mount: {}", mountpoint.display());
        self.mountpoint = Some(mountpoint);
        self.send(&wire::status_ok())?;
        Ok(Flow::Continue)
    }

    pub(crate) fn send(&mut self, pkt: &[u8]) -> io::Result<()> {
        net::write_all_timeout(&mut self.stream, pkt, LTSPFS_TIMEOUT)
    }

    pub(crate) fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn readonly(&self) -> bool {
        self.readonly
    }

    /// Decode a request path and join it under the mountpoint. On any
    /// problem (overlong, escaping, undecodable) the EACCES reply has already
    /// been sent and `None` is returned.
    pub(crate) fn fs_path(
        &mut self,
        dec: &mut Decoder<'_>,
        mountpoint: &Path,
    ) -> io::Result<Option<PathBuf>> {
        let limit = PATH_MAX.saturating_sub(mountpoint.as_os_str().len());
        let raw = match dec.get_bytes(limit) {
            Ok(raw) => raw,
            Err(_) => {
                self.send(&wire::status_fail(libc::EACCES))?;
                return Ok(None);
            }
        };
        match join_under(mountpoint, &raw) {
            Ok(path) => Ok(Some(path)),
            Err(errno) => {
                debug!("rejected path {:?}", String::from_utf8_lossy(&raw));
                self.send(&wire::status_fail(errno))?;
                Ok(None)
            }
        }
    }
}

/// Join a client-supplied path under `root`, resolving `.` and `..`
/// lexically. A `..` that would climb above `root` is refused, so the
/// exported sub-tree cannot be escaped by path construction.
pub(crate) fn join_under(root: &Path, client_path: &[u8]) -> Result<PathBuf, i32> {
    let rel = Path::new(OsStr::from_bytes(client_path));
    let mut kept: Vec<&OsStr> = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => kept.push(part),
            Component::ParentDir => {
                if kept.pop().is_none() {
                    return Err(libc::EACCES);
                }
            }
            Component::Prefix(_) => return Err(libc::EACCES),
        }
    }
    let mut out = root.to_path_buf();
    for part in kept {
        out.push(part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_rooted_at_the_mountpoint() {
        let root = Path::new("/media/usb0");
        assert_eq!(
            join_under(root, b"/photos/img.jpg").unwrap(),
            Path::new("/media/usb0/photos/img.jpg")
        );
        assert_eq!(join_under(root, b"/").unwrap(), root);
        assert_eq!(join_under(root, b"").unwrap(), root);
    }

    #[test]
    fn dot_and_dotdot_resolve_lexically() {
        let root = Path::new("/media/usb0");
        assert_eq!(
            join_under(root, b"/a/./b/../c").unwrap(),
            Path::new("/media/usb0/a/c")
        );
        assert_eq!(join_under(root, b"/a/..").unwrap(), root);
    }

    #[test]
    fn climbing_above_the_root_is_refused() {
        let root = Path::new("/media/usb0");
        assert_eq!(join_under(root, b"/.."), Err(libc::EACCES));
        assert_eq!(join_under(root, b"/a/../../etc/passwd"), Err(libc::EACCES));
        assert_eq!(join_under(root, b"../x"), Err(libc::EACCES));
    }
}
