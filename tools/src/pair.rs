// Pairs with a device and stores the record

use clap::Command;
use ioslink::{Host, LinkError, lockdown};

use crate::common;

pub fn register() -> Command {
    Command::new("pair")
        .about("Pairs with the device, waiting for the user to tap Trust")
}

pub async fn main(host: &Host, udid: Option<&str>) -> Result<(), LinkError> {
    let dev = common::select_device(host, udid).await?;
    println!("Accept the trust dialog on {}", dev.udid);
    lockdown::pair_and_save(host, &dev.udid, dev.device_id).await?;
    println!(
        "Paired, record mirrored to {}",
        host.pair_record_path(&dev.udid).display()
    );
    Ok(())
}
