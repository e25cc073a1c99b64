// Activates a device through mobileactivationd

use clap::{Arg, ArgAction, ArgMatches, Command};
use ioslink::{
    Host, LinkError,
    activation::{ActivationClient, ActivationOutcome},
};

use crate::common;

pub fn register() -> Command {
    Command::new("activate")
        .about("Activates the device against Apple's activation servers")
        .arg(
            Arg::new("state")
                .long("state")
                .action(ArgAction::SetTrue)
                .help("Only print the activation state"),
        )
}

pub async fn main(matches: &ArgMatches, host: &Host, udid: Option<&str>) -> Result<(), LinkError> {
    let (dev, provider) = common::select_provider(host, udid).await?;
    let client = ActivationClient::new(&provider)?;

    if matches.get_flag("state") {
        println!("Activation State: {}", client.state().await?);
        return Ok(());
    }

    match client.activate().await? {
        ActivationOutcome::AlreadyActivated => println!("{} is already activated", dev.udid),
        ActivationOutcome::Activated => println!("{} activated", dev.udid),
    }
    Ok(())
}
