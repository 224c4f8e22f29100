//! Network throughput measurement engine.
//!
//! `netmeter` measures the usable bandwidth between two hosts in the
//! iperf/nuttcp lineage: a server accepts a control connection, the client
//! negotiates test parameters, and one or more parallel TCP or UDP data
//! streams carry controlled traffic for a fixed duration. The receiving end
//! accounts for loss and jitter; results aggregate into a persisted report.
//!
//! A periodic monitor drives client sessions on a cadence over a longer
//! window, and a standalone analyzer reduces externally captured
//! video-player quality logs to summary counters.
//!
//! # Examples
//!
//! ```no_run
//! use netmeter::client::Client;
//! use netmeter::config::{Config, Protocol};
//! use std::time::Duration;
//!
//! # async fn run() -> netmeter::Result<()> {
//! let config = Config::client("192.168.1.10".to_string(), 5201)
//!     .with_protocol(Protocol::Udp)
//!     .with_bitrate(10_000_000)
//!     .with_duration(Duration::from_secs(10));
//!
//! let report = Client::new(config).run().await?;
//! report.print_summary();
//! # Ok(())
//! # }
//! ```

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod packet;
pub mod protocol;
pub mod report;
pub mod server;
pub mod stats;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use client::Client;
pub use config::{Config, Mode, Protocol};
pub use error::{Error, Result};
pub use orchestrator::{analyze_player_log, Monitor, MonitorConfig};
pub use report::TestReport;
pub use server::Server;

/// Crate version, logged at binary startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
