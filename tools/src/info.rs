// Dumps every Lockdown value of a device

use clap::Command;
use ioslink::{Host, LinkError, lockdown::LockdownClient};
use tracing::warn;

use crate::common;

pub fn register() -> Command {
    Command::new("info").about("Prints all Lockdown values of the device")
}

pub async fn main(host: &Host, udid: Option<&str>) -> Result<(), LinkError> {
    let (_, provider) = common::select_provider(host, udid).await?;
    let mut lockdown = LockdownClient::connect(&provider).await?;

    // Without a session the device only answers a handful of keys
    match provider.get_pairing_file_or_mirror(host).await {
        Ok(record) => {
            lockdown.start_session(&record).await?;
        }
        Err(e) => warn!("{e}; showing the values readable without a session"),
    }

    let values = lockdown.get_all_values().await?;
    println!("{}", ioslink::pretty_print_dictionary(&values));
    if lockdown.session().is_some() {
        lockdown.stop_session().await?;
    }
    Ok(())
}
