// Device selection shared by the subcommands

use ioslink::{
    Host, LinkError,
    provider::UsbmuxdProvider,
    usbmuxd::{ConnectionType, UsbmuxdDevice},
};

/// The device named by `--udid`, else the first USB device, else the first
/// device usbmuxd knows
pub async fn select_device(host: &Host, udid: Option<&str>) -> Result<UsbmuxdDevice, LinkError> {
    let mut usbmuxd = host.usbmuxd.connect().await?;
    if let Some(udid) = udid {
        return usbmuxd.get_device(udid).await;
    }

    let devs = usbmuxd.get_devices().await?.0;
    if let Some(dev) = devs.iter().find(|d| d.connection_type == ConnectionType::Usb) {
        return Ok(dev.clone());
    }
    devs.into_iter().next().ok_or(LinkError::DeviceNotFound)
}

pub async fn select_provider(
    host: &Host,
    udid: Option<&str>,
) -> Result<(UsbmuxdDevice, UsbmuxdProvider), LinkError> {
    let dev = select_device(host, udid).await?;
    let provider = UsbmuxdProvider::from_host(host, dev.udid.clone(), dev.device_id);
    Ok((dev, provider))
}
