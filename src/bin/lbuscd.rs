//! Workstation device announcer daemon.

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::process::exit;

use clap::error::ErrorKind;
use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use log::error;

use ltspfs::announcer::cdrom::CdromIoctl;
use ltspfs::announcer::{Announcer, FIFO_PATH};
use ltspfs::daemon;
use ltspfs::wire::LBUS_PORT;

fn main() {
    let cmd = Command::new("lbuscd")
        .version(crate_version!())
        .about("Announces hotplugged storage and CD-ROM media to subscribed login-server sessions")
        .disable_version_flag(true)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("portnum")
                .value_parser(value_parser!(u16))
                .help("TCP port to listen on (default 9202)"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Turn on debugging"),
        )
        .arg(
            Arg::new("nodaemon")
                .short('n')
                .long("nodaemon")
                .action(ArgAction::SetTrue)
                .help("Do not daemonize"),
        )
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .action(ArgAction::Version)
                .help("Display version"),
        );

    let matches = match cmd.try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            exit(code);
        }
    };

    let port = matches.get_one::<u16>("port").copied().unwrap_or(LBUS_PORT);
    let debug = matches.get_flag("debug");

    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if !debug && !matches.get_flag("nodaemon") {
        if let Err(e) = daemon::daemonize() {
            eprintln!("lbuscd: cannot daemonize: {e}");
            exit(1);
        }
    }

    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot listen on port {port}: {e}");
            exit(1);
        }
    };

    if let Err(e) = Announcer::new(CdromIoctl).run(listener, Path::new(FIFO_PATH)) {
        error!("lbuscd failed: {e}");
        exit(1);
    }
}
