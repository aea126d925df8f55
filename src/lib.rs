//! Token-protected groups and named barriers coordinated by a central TCP
//! server.
//!
//! A [`Server`] keeps track of registered clients and the groups they joined.
//! Each [`Client`] registers with the server under a unique [`NodeId`] and can
//! then join any number of groups. A group is created by its first member and
//! protected by the [`Token`] that member used, later members must present the
//! same token.
//!
//! # Sync points
//! Members of a group can wait on a named sync point with
//! [`Group::wait_sync`]. The call returns true once every current member of
//! the group has arrived at the sync point, or false if the sync point timed
//! out first. Members that join or leave while a sync point is open change the
//! set of members that must arrive.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rendezvous::{Client, ClientConfig, MemberCount, NodeId, Token};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new(
//!     "127.0.0.1:4000".parse()?,
//!     NodeId::new("worker-1")?,
//!     ClientConfig::default(),
//! )?;
//! client.start()?;
//!
//! let group = client.join(NodeId::new("workers")?, Token::from_secret("secret"))?;
//! group.wait_members(MemberCount::at_least(2), Duration::from_secs(10))?;
//! if group.wait_sync(&NodeId::new("step-1")?, Duration::from_secs(5))? {
//!     println!("all workers arrived");
//! }
//! # Ok(())
//! # }
//! ```

pub(crate) mod barrier;
pub(crate) mod client;
pub(crate) mod group;
pub(crate) mod id;
pub(crate) mod membership;
pub(crate) mod message;
pub(crate) mod messenger;
pub(crate) mod protocol;
pub(crate) mod scheduler;
pub(crate) mod server;
pub(crate) mod utils;

pub use client::{Client, ClientConfig, StartClientError};
pub use id::{InvalidNodeId, NodeId, Token};
pub use membership::{Group, JoinError, LeaveError, MemberCount, SyncError};
pub use server::{ConfigError, Server, ServerConfig, StartServerError};
