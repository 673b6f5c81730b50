//! Local-device filesystem suite for diskless thin clients.
//!
//! A workstation with no disk of its own still has local media: USB sticks,
//! CD-ROMs, card readers. This crate makes those visible inside a session on
//! the login server. Three programs cooperate:
//!
//! - `ltspfsd` runs on the workstation and serves POSIX-shaped filesystem
//!   calls against a sub-tree of the local filesystem, over one TCP
//!   connection per session, after an X11-cookie authentication handshake.
//! - `ltspfs` runs on the login server, mounts a FUSE filesystem, and
//!   forwards every kernel callback to the workstation over that connection.
//! - `lbuscd` runs on the workstation, watches hotplug events and CD-ROM
//!   trays, and tells subscribed sessions which devices exist so they can
//!   drive the mount.
//!
//! The wire format is XDR-flavored length-prefixed packets; see [`wire`] for
//! the opcode registry and framing rules.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod announcer;
pub mod client;
pub mod daemon;
pub mod net;
pub mod server;
pub mod wire;
pub mod xdr;
