// Forwards a local TCP port to a port on the device

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Arg, ArgMatches, Command, value_parser};
use ioslink::{Host, LinkError, provider::DeviceProvider};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::common;

pub fn register() -> Command {
    Command::new("forward")
        .about("Forwards connections on a local port to a port on the device")
        .arg(
            Arg::new("host_port")
                .value_name("HOST_PORT")
                .required(true)
                .value_parser(value_parser!(u16).range(1..)),
        )
        .arg(
            Arg::new("device_port")
                .value_name("DEVICE_PORT")
                .required(true)
                .value_parser(value_parser!(u16).range(1..)),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .value_parser(value_parser!(IpAddr))
                .help("Address to listen on (default 127.0.0.1)"),
        )
}

pub async fn main(matches: &ArgMatches, host: &Host, udid: Option<&str>) -> Result<(), LinkError> {
    let host_port = *matches
        .get_one::<u16>("host_port")
        .ok_or(LinkError::UnexpectedResponse)?;
    let device_port = *matches
        .get_one::<u16>("device_port")
        .ok_or(LinkError::UnexpectedResponse)?;
    let bind = matches
        .get_one::<IpAddr>("bind")
        .copied()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let (dev, provider) = common::select_provider(host, udid).await?;
    let listener = TcpListener::bind(SocketAddr::new(bind, host_port)).await?;
    info!(
        "Forwarding {} to port {device_port} on {}",
        listener.local_addr()?,
        dev.udid
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("Accepted {peer}");
        let provider = provider.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge(stream, &provider, device_port).await {
                error!("Forwarding for {peer} failed: {e}");
            }
            debug!("Connection from {peer} closed");
        });
    }
}

async fn bridge(
    mut stream: TcpStream,
    provider: &dyn DeviceProvider,
    device_port: u16,
) -> Result<(), LinkError> {
    let mut device = provider.connect(device_port).await?.into_inner()?;
    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut device).await?;
    debug!("Forwarded {up} bytes up and {down} bytes down");
    Ok(())
}
