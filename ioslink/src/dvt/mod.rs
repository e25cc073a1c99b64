//! DTX, the multiplexed RPC protocol of instruments, testmanagerd and the
//! accessibility audit daemon
//!
//! ```rust,no_run
//! # async fn audit(provider: &dyn ioslink::provider::DeviceProvider) -> Result<(), ioslink::LinkError> {
//! use ioslink::dvt::DtxConnection;
//!
//! let mut conn = DtxConnection::connect(provider).await?;
//! conn.handshake().await?;
//! let channel = conn
//!     .request_channel("com.apple.instruments.server.services.deviceinfo")
//!     .await?;
//! let reply = channel.call("runningProcesses", Vec::new()).await?;
//! println!("{:?}", reply.value());
//! # Ok(())
//! # }
//! ```

pub mod auxiliary;
pub mod channel;
pub mod connection;
pub mod message;

pub use auxiliary::AuxValue;
pub use channel::{Channel, Subscription};
pub use connection::DtxConnection;
pub use message::{Body, Message, MessageHeader, MessageType};
