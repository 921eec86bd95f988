//! Cluster routing: table snapshots and the background monitor.

pub mod monitor;
pub mod table;

pub use monitor::Monitor;
pub use table::{RouteRow, RoutingTable};
