//! A userspace IPv6/TCP stack
//!
//! Lets the host open TCP connections to the device's tunnel address without
//! a kernel TUN interface. Packets travel over any
//! [`PacketLink`](crate::tunnel::link::PacketLink).

#[cfg(feature = "tunnel_tcp_stack")]
pub mod adapter;
#[cfg(feature = "tunnel_tcp_stack")]
pub mod handle;
pub mod packets;
#[cfg(feature = "tunnel_tcp_stack")]
pub mod pcap;

#[cfg(feature = "tunnel_tcp_stack")]
pub use adapter::Adapter;
#[cfg(feature = "tunnel_tcp_stack")]
pub use handle::{AdapterHandle, StreamHandle};
#[cfg(feature = "tunnel_tcp_stack")]
pub use pcap::PcapWriter;
