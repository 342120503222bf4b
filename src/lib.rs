//! A client for the NATS wire protocol: subject-addressed publish/subscribe
//! with at-most-once delivery over a persistent connection.
//!
//! The connection maintains a pool of candidate servers, survives broker
//! restarts by reconnecting and replaying subscriptions, buffers publishes
//! issued during the reconnect window, and multiplexes request/reply
//! round-trips over a shared inbox.
//!
//! ```rust,no_run
//! use natslink::Connection;
//!
//! # async fn demo() -> natslink::Result<()> {
//! let nc = Connection::connect_to("nats://127.0.0.1:4222").await?;
//!
//! let sub = nc.subscribe_sync("greet.*")?;
//! nc.publish("greet.joe", b"hello").await?;
//! let msg = sub.next_msg(Some(std::time::Duration::from_secs(1))).await?;
//! println!("{}: {:?}", msg.subject, msg.payload);
//!
//! nc.close().await;
//! # Ok(())
//! # }
//! ```

mod auth;
mod connection;
mod delivery;
mod errors;
mod message;
mod options;
mod outbound;
mod parser;
mod protocol;
mod request;
mod servers;
mod stats;
mod subscription;

pub use connection::{Connection, Status};
pub use delivery::set_delivery_pool_size;
pub use errors::{Error, Result};
pub use message::Message;
pub use options::{
    ConnectionCallback, ErrorCallback, IpFamily, JwtProvider, MessageHandler, NonceSigner,
    Options, TokenProvider,
};
pub use protocol::ServerInfo;
pub use request::new_inbox;
pub use stats::Statistics;
pub use subscription::Subscription;

/// Internals re-exported for the criterion benches. Not a stable API.
#[doc(hidden)]
pub mod internal {
    pub use crate::parser::{Parser, ServerOp};
}
