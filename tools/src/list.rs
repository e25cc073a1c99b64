// Lists attached devices

use clap::{Arg, ArgAction, ArgMatches, Command};
use ioslink::{
    Host, LinkError,
    lockdown::LockdownClient,
    provider::UsbmuxdProvider,
    usbmuxd::{ConnectionType, UsbmuxdDevice},
};
use tracing::warn;

/// Keys shown by `list --details`
const DETAIL_KEYS: [&str; 4] = ["ProductName", "ProductType", "ProductVersion", "DeviceName"];

pub fn register() -> Command {
    Command::new("list")
        .about("Lists attached devices, one UDID per line")
        .arg(
            Arg::new("details")
                .long("details")
                .action(ArgAction::SetTrue)
                .help("Also read the product and device name over Lockdown"),
        )
}

pub async fn main(matches: &ArgMatches, host: &Host) -> Result<(), LinkError> {
    let devices = host.usbmuxd.connect().await?.get_devices().await?;
    if !matches.get_flag("details") {
        print!("{devices}");
        return Ok(());
    }

    for dev in devices {
        let details = match read_details(host, &dev).await {
            Ok(d) => d.join("\t"),
            Err(e) => {
                warn!("Unable to read details of {}: {e}", dev.udid);
                String::new()
            }
        };
        println!("{}\t{}\t{details}", dev.udid, connection_name(&dev.connection_type));
    }
    Ok(())
}

fn connection_name(connection: &ConnectionType) -> String {
    match connection {
        ConnectionType::Usb => "USB".to_string(),
        ConnectionType::Network(addr) => format!("Network({addr})"),
        ConnectionType::Unknown(s) => s.clone(),
    }
}

async fn read_details(host: &Host, dev: &UsbmuxdDevice) -> Result<Vec<String>, LinkError> {
    let provider = UsbmuxdProvider::from_host(host, dev.udid.clone(), dev.device_id);
    let mut lockdown = LockdownClient::connect(&provider).await?;
    let mut details = Vec::with_capacity(DETAIL_KEYS.len());
    for key in DETAIL_KEYS {
        let value = lockdown.get_value(Some(key), None).await?;
        details.push(value.as_string().unwrap_or_default().to_string());
    }
    Ok(details)
}
