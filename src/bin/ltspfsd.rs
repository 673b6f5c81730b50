//! Terminal-side file server daemon.

use std::process::exit;

use clap::{crate_version, Arg, ArgAction, Command};
use log::error;

use ltspfs::daemon;
use ltspfs::server::{self, ServerConfig};

fn main() {
    let matches = Command::new("ltspfsd")
        .version(crate_version!())
        .about("Serves a sub-tree of the local filesystem to one login-server session per connection")
        .arg(
            Arg::new("readonly")
                .short('r')
                .long("readonly")
                .action(ArgAction::SetTrue)
                .help("Refuse every operation that would modify the exported tree"),
        )
        .arg(
            Arg::new("noauth")
                .short('a')
                .long("no-auth")
                .action(ArgAction::SetTrue)
                .help("Skip X display authentication (local testing only)"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Stay in the foreground, serve in process, log verbosely"),
        )
        .get_matches();

    let cfg = ServerConfig {
        readonly: matches.get_flag("readonly"),
        skip_auth: matches.get_flag("noauth"),
        debug: matches.get_flag("debug"),
        ..ServerConfig::default()
    };

    let default_level = if cfg.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if !cfg.debug {
        if let Err(e) = daemon::daemonize() {
            eprintln!("ltspfsd: cannot daemonize: {e}");
            exit(1);
        }
        let signals = daemon::install_sigchld_reaper().and_then(|()| daemon::install_sigterm_exit());
        if let Err(e) = signals {
            error!("cannot install signal handlers: {e}");
            exit(1);
        }
    }

    if let Err(e) = server::run(&cfg) {
        error!("ltspfsd failed: {e}");
        exit(1);
    }
}
