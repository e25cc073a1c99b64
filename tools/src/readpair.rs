// Prints the stored pair record of a device

use clap::Command;
use ioslink::{Host, LinkError};

use crate::common;

pub fn register() -> Command {
    Command::new("readpair")
        .about("Prints the pair record from usbmuxd, or the host's mirror of it")
}

pub async fn main(host: &Host, udid: Option<&str>) -> Result<(), LinkError> {
    let (_, provider) = common::select_provider(host, udid).await?;
    let record = provider.get_pairing_file_or_mirror(host).await?;
    println!("{}", String::from_utf8(record.serialize()?)?);
    Ok(())
}
