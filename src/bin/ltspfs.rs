//! FUSE client: mount a terminal's exported directory on the login server.
//!
//! Invoked nfs-style:
//!
//!     ltspfs host:/dir/to/mount /local/mountpoint [-o opt[,opt...]]
//!
//! The `host:/dir` argument names the terminal and the directory its file
//! server exports; the first remaining absolute path is the local FUSE
//! mountpoint; `-o` lists pass through to the host mount machinery.

use std::env;
use std::path::{Path, PathBuf};
use std::process::exit;

use fuser::MountOption;
use log::error;

use ltspfs::client::{self, fuse::LtspFs, RemoteFs};
use ltspfs::wire::SERVER_PORT;

fn usage() -> ! {
    eprintln!("Usage: ltspfs host:/dir/to/mount /mountpoint <fuse options>");
    exit(1);
}

fn parse_option(opt: &str) -> MountOption {
    match opt {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        other => MountOption::CUSTOM(other.to_string()),
    }
}

/// Forward the remaining arguments to the FUSE mount unchanged; only `-o`
/// lists carry options we understand.
fn mount_options(args: &[String]) -> Vec<MountOption> {
    let mut options = vec![MountOption::FSName("ltspfs".to_string())];
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let list = if arg == "-o" {
            match iter.next() {
                Some(list) => list.as_str(),
                None => usage(),
            }
        } else if let Some(list) = arg.strip_prefix("-o") {
            list
        } else {
            continue;
        };
        options.extend(list.split(',').filter(|o| !o.is_empty()).map(parse_option));
    }
    options
}

fn main() {
    env_logger::init();

    // nfs-style splitting: the ':' argument is the remote spec, the first
    // other absolute path is the local mountpoint, the rest is for FUSE.
    let mut host_spec: Option<String> = None;
    let mut mountpoint: Option<PathBuf> = None;
    let mut fuse_args: Vec<String> = Vec::new();
    for arg in env::args().skip(1) {
        if host_spec.is_none() && arg.contains(':') {
            host_spec = Some(arg);
        } else if mountpoint.is_none() && arg.starts_with('/') {
            mountpoint = Some(PathBuf::from(arg));
        } else {
            fuse_args.push(arg);
        }
    }

    let (Some(host_spec), Some(mountpoint)) = (host_spec, mountpoint) else {
        usage();
    };
    let Some((host, remote_dir)) = host_spec.split_once(':') else {
        usage();
    };
    if host.is_empty() || !remote_dir.starts_with('/') {
        eprintln!("Remote dir must be specified as host:/dir.");
        exit(1);
    }

    let remote = match RemoteFs::connect(host, SERVER_PORT) {
        Ok(remote) => remote,
        Err(e) => {
            eprintln!("ltspfs: cannot connect to {host}: {e}");
            exit(1);
        }
    };

    let cookie = match client::display_cookie() {
        Ok(cookie) => cookie,
        Err(e) => {
            eprintln!("ltspfs: {e}");
            exit(1);
        }
    };
    if let Err(e) = remote.send_xauth(&cookie) {
        eprintln!("ltspfs: authentication failed: {e}");
        exit(1);
    }
    if let Err(e) = remote.mount(Path::new(remote_dir)) {
        eprintln!("ltspfs: couldn't mount {remote_dir}: {e}");
        exit(1);
    }

    if let Err(e) = client::spawn_pinger(remote.clone(), mountpoint.clone()) {
        eprintln!("ltspfs: cannot start keepalive thread: {e}");
        exit(1);
    }

    let options = mount_options(&fuse_args);
    let fs = LtspFs::new(remote, mountpoint.clone());
    if let Err(e) = fuser::mount2(fs, &mountpoint, &options) {
        error!("mount at {} failed: {e}", mountpoint.display());
        exit(1);
    }
}
