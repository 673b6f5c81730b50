//! Login-server-side filesystem client.
//!
//! One TCP connection to the terminal carries every operation for the life of
//! the mount. [`RemoteFs`] speaks the wire protocol over that connection and
//! [`fuse::LtspFs`] adapts it to the host FUSE callback surface. A keepalive
//! pinger doubles as the dead-terminal detector: when the terminal is powered
//! off mid-session, the ping fails and the mount is torn down instead of
//! wedging every process that touches it.

pub mod fuse;
mod remote;

pub use remote::RemoteFs;

use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::thread;

use log::{debug, error, info};

use crate::wire::PING_INTERVAL;

/// Outcome of a wire operation.
#[derive(Debug)]
pub enum RpcError {
    /// The connection is no longer usable; the mount must come down.
    Transport(io::Error),
    /// The remote syscall failed; the errno travels back to the kernel.
    Errno(i32),
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Transport(e)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(e) => write!(f, "transport error: {e}"),
            RpcError::Errno(errno) => write!(f, "remote errno {errno}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Produce the XAUTH payload for the current `$DISPLAY`.
///
/// A `localhost:` display means the X connection is tunneled and the real
/// cookie would never match on the terminal; the literal dummy payload pairs
/// with the server's `-a` mode.
pub fn display_cookie() -> io::Result<Vec<u8>> {
    let display = env::var("DISPLAY")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "$DISPLAY is not set"))?;

    if display.starts_with("localhost") {
        debug!("tunneled display {display}, sending dummy auth");
        return Ok(b"DUMMY AUTH".to_vec());
    }

    let output = Command::new("xauth")
        .args(["extract", "-", &display])
        .output()?;
    if !output.status.success() || output.stdout.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("xauth extract failed for {display}"),
        ));
    }
    Ok(output.stdout)
}

/// Last-resort teardown: ask fusermount to drop the mount, then exit. Called
/// when the connection to the terminal is gone, so there is nothing left to
/// shut down gracefully.
pub fn unmount_and_exit(mountpoint: &Path) -> ! {
    info!("unmounting {}", mountpoint.display());
    for bin in ["fusermount3", "fusermount"] {
        let status = Command::new(bin)
            .arg("-u")
            .arg("-z")
            .arg("--")
            .arg(mountpoint)
            .status();
        if matches!(status, Ok(st) if st.success()) {
            break;
        }
    }
    process::exit(1);
}

/// Start the detached keepalive thread. Every interval it takes the
/// connection lock, pings, and reads the reply; any failure brings the whole
/// client down via [`unmount_and_exit`].
pub fn spawn_pinger(remote: RemoteFs, mountpoint: PathBuf) -> io::Result<()> {
    thread::Builder::new()
        .name("ltspfs-pinger".into())
        .spawn(move || loop {
            thread::sleep(PING_INTERVAL);
            if let Err(e) = remote.ping() {
                error!("keepalive ping failed: {e}");
                unmount_and_exit(&mountpoint);
            }
        })?;
    Ok(())
}
