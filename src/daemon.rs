//! Daemonization and signal plumbing shared by the two workstation daemons.

use std::fs::File;
use std::io;
use std::process::exit;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2_stderr, dup2_stdin, dup2_stdout, fork, setsid, ForkResult};
use std::os::fd::AsFd;

/// Detach from the controlling terminal: fork, start a new session, chdir to
/// `/` so no filesystem stays pinned, clear the umask, and point the standard
/// descriptors at `/dev/null`.
pub fn daemonize() -> io::Result<()> {
    if let ForkResult::Parent { .. } = unsafe { fork() }? {
        exit(0);
    }
    setsid()?;
    chdir("/")?;
    umask(Mode::empty());

    let devnull = File::options().read(true).write(true).open("/dev/null")?;
    dup2_stdin(devnull.as_fd())?;
    dup2_stdout(devnull.as_fd())?;
    dup2_stderr(devnull.as_fd())?;
    Ok(())
}

extern "C" fn reap_children(_: libc::c_int) {
    // Collect every exited worker; more than one SIGCHLD can coalesce.
    while unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) } > 0 {}
}

extern "C" fn terminate(_: libc::c_int) {
    unsafe { libc::_exit(0) }
}

/// Reap forked connection workers as they exit.
pub fn install_sigchld_reaper() -> io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(reap_children),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }?;
    Ok(())
}

/// Exit cleanly on SIGTERM.
pub fn install_sigterm_exit() -> io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    Ok(())
}
