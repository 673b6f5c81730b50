//! Terminal-side file server.
//!
//! Listens on a fixed TCP port and serves POSIX-shaped filesystem calls
//! against a sub-tree of the terminal's local filesystem. The parent process
//! only accepts; each accepted connection is handed to a forked worker that
//! owns one [`Session`] for its lifetime. In debug mode the session runs in
//! process so a single connection can be traced end to end.

mod auth;
mod automount;
mod ops;
mod session;

pub use session::Session;

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::process::exit;

use log::{debug, error, info};
use nix::unistd::{fork, ForkResult};

use crate::wire::SERVER_PORT;

/// Server-wide options fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Refuse every operation that would modify the exported tree.
    pub readonly: bool,
    /// Accept any XAUTH ticket without probing a display. Local testing only.
    pub skip_auth: bool,
    /// Stay in the foreground and serve connections in process.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: SERVER_PORT,
            readonly: false,
            skip_auth: false,
            debug: false,
        }
    }
}

/// Accept loop. Never returns except on listener failure.
pub fn run(cfg: &ServerConfig) -> io::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.port))?;
    info!("ltspfsd listening on port {}", cfg.port);

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        debug!("connection from {peer}");

        if cfg.debug {
            match Session::new(stream, cfg).run() {
                Ok(()) => debug!("session from {peer} finished"),
                Err(e) => error!("session from {peer} died: {e}"),
            }
            continue;
        }

        match unsafe { fork() }? {
            ForkResult::Child => {
                drop(listener);
                let code = match Session::new(stream, cfg).run() {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("worker for {peer} died: {e}");
                        1
                    }
                };
                exit(code);
            }
            ForkResult::Parent { child } => {
                debug!("worker {child} owns {peer}");
                drop(stream);
            }
        }
    }
}
