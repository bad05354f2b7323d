//! Test-harness monitor for a `kaf consume` client running on a cluster node.
//!
//! [`monitor::OffsetMonitor`] launches the consumer through a
//! [`remote::NodeAccount`], parses its output with [`parser::OffsetParser`],
//! and exposes the newest offset read per partition so tests can assert on
//! consumption progress.

pub mod brokers;
pub mod config;
pub mod monitor;
pub mod parser;
pub mod remote;

pub use monitor::{MonitorError, OffsetMonitor, OffsetSnapshot};
