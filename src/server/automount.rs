//! Best-effort mount helpers.
//!
//! The terminal image may ship `/sbin/ltspfs_mount` and `/sbin/ltspfs_umount`
//! to prepare and tear down the local medium on demand. Their absence is
//! normal and their failure is only logged; the session's `mounted` flag
//! tracks intent either way.

use std::path::Path;
use std::process::Command;

use log::{debug, warn};

const MOUNT_HELPER: &str = "/sbin/ltspfs_mount";
const UMOUNT_HELPER: &str = "/sbin/ltspfs_umount";

pub(crate) fn mount(mountpoint: &Path) {
    invoke(Path::new(MOUNT_HELPER), mountpoint);
}

pub(crate) fn unmount(mountpoint: &Path) {
    invoke(Path::new(UMOUNT_HELPER), mountpoint);
}

fn invoke(helper: &Path, mountpoint: &Path) {
    if !helper.exists() {
        debug!("{} not installed, skipping", helper.display());
        return;
    }
    match Command::new(helper).arg(mountpoint).status() {
        Ok(status) if status.success() => {
            debug!("{} {} ok", helper.display(), mountpoint.display());
        }
        Ok(status) => warn!("{} exited with {status}", helper.display()),
        Err(e) => warn!("could not run {}: {e}", helper.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn missing_helper_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        invoke(&dir.path().join("no-such-helper"), Path::new("/media/usb0"));
    }

    #[test]
    fn helper_receives_the_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let helper = dir.path().join("helper.sh");
        fs::write(&helper, format!("#!/bin/sh\necho \"$1\" > {}\n", marker.display())).unwrap();
        fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

        invoke(&helper, Path::new("/media/usb0"));

        let recorded = fs::read_to_string(&marker).unwrap();
        assert_eq!(recorded.trim(), "/media/usb0");
    }
}
