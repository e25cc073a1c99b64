// Prints attach and detach events until interrupted

use clap::Command;
use futures_util::StreamExt;
use ioslink::{Host, LinkError, usbmuxd::UsbmuxdListenEvent};

pub fn register() -> Command {
    Command::new("listen").about("Prints device attach, detach and pair events")
}

pub async fn main(host: &Host) -> Result<(), LinkError> {
    let mut usbmuxd = host.usbmuxd.connect().await?;
    let mut events = usbmuxd.listen().await?;
    while let Some(event) = events.next().await {
        match event? {
            UsbmuxdListenEvent::Attached(dev) => {
                println!("Attached {} (id {}, {:?})", dev.udid, dev.device_id, dev.connection_type)
            }
            UsbmuxdListenEvent::Detached(id) => println!("Detached id {id}"),
            UsbmuxdListenEvent::Paired(id) => println!("Paired id {id}"),
        }
    }
    Ok(())
}
