//! The tap-node binary crate: HTTP surface, CLI, configuration, and the
//! wiring that assembles the ledger store, admission front, and (for the
//! script front) the settlement pool into one running process.

pub mod config;
pub mod node;

pub use node::{run_node, test_router_with_memtap, Cli};

pub const TAP_NODE_VERSION: &str = env!("CARGO_PKG_VERSION");
