//! X11 ticket verification.
//!
//! The peer proves it acts for the user sitting at this terminal by handing
//! over the X authority record for its `$DISPLAY`. That record is staged in a
//! private file, `$XAUTHORITY` is pointed at it, and a display connection is
//! attempted against this host. Only a caller holding the real magic cookie
//! can make any of those connections succeed. The staged file is removed
//! before the verdict is returned.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::process;

use log::{debug, trace};
use nix::unistd::gethostname;

/// Highest display number probed, inclusive.
const MAX_DISPLAY: u32 = 11;

pub(crate) fn verify_cookie(cookie: &[u8]) -> io::Result<bool> {
    let staged = env::temp_dir().join(format!(".ltspfs-xauth-{}", process::id()));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(&staged)?;
    file.write_all(cookie)?;
    drop(file);

    // Safe to set process-wide: every session owns a forked worker.
    env::set_var("XAUTHORITY", &staged);

    let hostname = gethostname()?;
    let hostname = hostname.to_string_lossy();

    let mut found = false;
    for number in 0..=MAX_DISPLAY {
        let display = format!("{hostname}:{number}");
        match x11rb::connect(Some(&display)) {
            Ok(_) => {
                debug!("cookie accepted by display {display}");
                found = true;
                break;
            }
            Err(e) => trace!("display {display}: {e}"),
        }
    }

    let _ = fs::remove_file(&staged);
    Ok(found)
}
