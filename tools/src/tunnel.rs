// Brings up an iOS 17+ tunnel and keeps it open until Ctrl-C

use std::net::SocketAddr;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use ioslink::{
    Host, LinkError,
    remote_pairing::TransportProtocol,
    tunnel::{DataPlane, NoHook, Tunnel, TunnelMode},
};
use tracing::info;

use crate::common;

pub fn register() -> Command {
    Command::new("tunnel")
        .about("Starts a tunnel to an iOS 17+ device")
        .arg(
            Arg::new("userspace")
                .long("userspace")
                .action(ArgAction::SetTrue)
                .conflicts_with("kernel")
                .help("Serve the tunnel from the userspace stack (default)"),
        )
        .arg(
            Arg::new("kernel")
                .long("kernel")
                .action(ArgAction::SetTrue)
                .help("Create a TUN interface, needs privileges"),
        )
        .arg(
            Arg::new("tcp")
                .long("tcp")
                .action(ArgAction::SetTrue)
                .help("Carry the remote pairing tunnel over TLS-PSK instead of QUIC"),
        )
        .arg(
            Arg::new("rsd")
                .long("rsd")
                .value_name("ADDR")
                .value_parser(value_parser!(SocketAddr))
                .help("RSD address of an iOS 17.0 to 17.3 device"),
        )
}

pub async fn main(matches: &ArgMatches, host: &Host, udid: Option<&str>) -> Result<(), LinkError> {
    let mode = if matches.get_flag("kernel") {
        TunnelMode::Kernel
    } else {
        TunnelMode::Userspace
    };
    let protocol = if matches.get_flag("tcp") {
        TransportProtocol::Tcp
    } else {
        TransportProtocol::Quic
    };
    let rsd = matches.get_one::<SocketAddr>("rsd").copied();

    let (dev, provider) = common::select_provider(host, udid).await?;
    let mut device = dev.to_device();
    let tunnel =
        Tunnel::start_for_device(host, &provider, &mut device, rsd, protocol, mode, &NoHook)
            .await?;

    let tunnel_info = tunnel.info();
    println!("Device address: {}", tunnel_info.address);
    println!("RSD port: {}", tunnel_info.rsd_port);
    match &tunnel.plane {
        DataPlane::Kernel { interface } => println!("Interface: {interface}"),
        DataPlane::Userspace { listener, .. } => println!("Userspace listener: {listener}"),
    }

    tokio::signal::ctrl_c().await?;
    info!("Closing tunnel to {}", device.udid);
    tunnel.close().await;
    Ok(())
}
