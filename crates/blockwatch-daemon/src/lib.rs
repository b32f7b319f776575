#![warn(missing_docs)]

//! Blockwatch daemon: hosts the blockwatch runtime as a long-running process.
//!
//! Config file → DaemonConfig → FileStore (sealed credentials) + HttpRelationshipClient → Blockwatch

pub mod cli;
pub mod config;
pub mod file_store;
pub mod http_client;

pub use config::DaemonConfig;
pub use file_store::FileStore;
pub use http_client::HttpRelationshipClient;
