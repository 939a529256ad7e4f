//! # zkwire
//!
//! Async client for the ZooKeeper session protocol: a durable logical
//! session over a rotating server list, framed big-endian records over
//! a single TCP connection, xid-correlated request futures, and
//! one-shot watch notifications.
//!
//! ## Architecture
//!
//! - **Session machine** ([`client::ZkClient`] drives it): handshake,
//!   heartbeats, reconnection with auth replay and watch re-arming,
//!   expiry detection
//! - **Protocol** ([`protocol`]): big-endian record codec and
//!   length-prefixed framing
//! - **Watches** ([`watch`]): one-shot change notifications delivered
//!   in order, off the I/O path
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use zkwire::{Acl, CreateMode, ZkClient};
//!
//! #[tokio::main]
//! async fn main() -> zkwire::Result<()> {
//!     let zk = ZkClient::connect("127.0.0.1:2181", Duration::from_secs(10)).await?;
//!     zk.create("/foo", vec![1], Acl::open_unsafe(), CreateMode::Persistent)
//!         .await?;
//!     let children = zk.get_children("/", false).await?;
//!     println!("root children: {children:?}");
//!     zk.close().await
//! }
//! ```

pub mod client;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod watch;

mod pending;
mod session;
mod transport;

pub use client::{ZkClient, ZkClientBuilder};
pub use error::{DecodeError, Result, ZkError};
pub use protocol::records::perms;
pub use protocol::{Acl, CreateMode, Stat};
pub use session::SessionState;
pub use watch::{EventType, KeeperState, WatchedEvent, Watcher};
