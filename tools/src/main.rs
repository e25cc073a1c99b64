// ioslink - talk to iOS devices over usbmuxd, Lockdown and iOS 17+ tunnels

use clap::{Arg, ArgAction, Command};
use ioslink::{Host, LinkError};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod activate;
mod common;
mod forward;
mod info;
mod list;
mod listen;
mod pair;
mod readpair;
mod tunnel;

fn cli() -> Command {
    Command::new("ioslink")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Talk to iOS devices over usbmuxd, Lockdown and iOS 17+ tunnels")
        .arg(
            Arg::new("udid")
                .short('u')
                .long("udid")
                .value_name("UDID")
                .global(true)
                .help("Target a specific device instead of the first USB device"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log protocol traffic"),
        )
        .arg(
            Arg::new("pair_dir")
                .long("pair-dir")
                .value_name("DIR")
                .global(true)
                .help("Directory of pair records (default $IOSLINK_PAIR_DIR or ~/.ioslink/pair_records)"),
        )
        .subcommand(list::register())
        .subcommand(listen::register())
        .subcommand(info::register())
        .subcommand(pair::register())
        .subcommand(readpair::register())
        .subcommand(forward::register())
        .subcommand(activate::register())
        .subcommand(tunnel::register())
        .subcommand_required(true)
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let default_level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut host = Host::from_env().with_label("ioslink");
    if let Some(dir) = matches.get_one::<String>("pair_dir") {
        host = host.with_pair_dir(dir);
    }
    let udid = matches.get_one::<String>("udid").map(String::as_str);

    let res: Result<(), LinkError> = match matches.subcommand() {
        Some(("list", sub)) => list::main(sub, &host).await,
        Some(("listen", _)) => listen::main(&host).await,
        Some(("info", _)) => info::main(&host, udid).await,
        Some(("pair", _)) => pair::main(&host, udid).await,
        Some(("readpair", _)) => readpair::main(&host, udid).await,
        Some(("forward", sub)) => forward::main(sub, &host, udid).await,
        Some(("activate", sub)) => activate::main(sub, &host, udid).await,
        Some(("tunnel", sub)) => tunnel::main(sub, &host, udid).await,
        _ => {
            eprintln!("No subcommand passed, pass -h for help");
            std::process::exit(2);
        }
    };

    if let Err(e) = res {
        error!(code = e.code(), "{e}");
        std::process::exit(1);
    }
}
