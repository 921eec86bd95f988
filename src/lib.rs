//! BoltGate — a protocol-aware Bolt proxy for clustered graph databases.
//!
//! Unlike a generic L4 proxy, BoltGate terminates the Bolt handshake,
//! inspects authentication and transaction-control messages, consults the
//! cluster's routing table and forwards each transaction to an appropriate
//! reader or writer node. Bolt-over-WebSocket clients are accepted on the
//! same listening port.
//!
//! # Architecture
//!
//! - **`packstream`** — Partial PackStream decoding/encoding (inspection subset)
//! - **`message`** — Frame scanning, message identification, payload inspection
//! - **`conn`** — Message-oriented connections (direct TCP and WebSocket)
//! - **`client`** — Outbound Bolt query client used by the routing monitor
//! - **`routing`** — Routing-table snapshots and the background monitor
//! - **`backend`** — Cluster configuration, TLS, fan-out authentication
//! - **`proxy`** — Accept loop and the per-client session state machine

pub mod backend;
pub mod client;
pub mod conn;
pub mod error;
pub mod message;
pub mod packstream;
pub mod proxy;
pub mod routing;
pub mod version;
