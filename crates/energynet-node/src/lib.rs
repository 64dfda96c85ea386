//! The EnergyNet Protocol node binary's library surface: the `Node`
//! facade (component 10) and its on-disk configuration.

pub mod config;
pub mod node;

pub use config::FileConfig;
pub use node::{Node, NodeConfig, NodeError};
