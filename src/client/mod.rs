//! Outbound Bolt query client.
//!
//! Used exclusively by the routing monitor to run its two cluster queries.
//! Speaks the same pinned Bolt 4.2 the proxy grants its own clients.

mod connection;
pub(crate) mod wire;

pub use connection::{Credentials, QueryConnection, USER_AGENT};
