//! # RDMA Perf Supervisor Library
//!
//! Runs pools of perftest workers (`ib_write_bw`, `ib_read_lat`, ...) in
//! parallel, each pinned to its own CPU core and TCP port, and turns their
//! line-oriented output into typed samples.
//!
//! ## Modes of Operation
//!
//! - **One-shot**: the [`BatchOrchestrator`] launches exactly N workers,
//!   waits for them to exit (or for an interrupt), and reports whatever was
//!   captured. Partial results are valid output.
//! - **Persistent**: the [`WorkerSupervisor`] keeps server workers alive,
//!   respawning each with its original core, port and binary when it exits.
//!   Repeated start failures back off and can quarantine a slot.
//!
//! ## Architecture Overview
//!
//! - `ports` / `cores`: port allocation and round-robin core assignment
//! - `topology`: resolves the RDMA device and its local CPU list from sysfs
//! - `command`: binary selection and argument construction
//! - `parser`: classifies one output line into a [`ParseEvent`]
//! - `worker`: one pinned process plus the task that reads its output
//! - `supervisor` / `orchestrator`: persistent and one-shot pools
//! - `results`: the shared [`ResultAggregator`] and CSV/JSON [`ResultLogger`]
//! - `metrics`: Prometheus gauges and the optional `/metrics` endpoint
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use rdma_perf::{BatchOrchestrator, CorePlan, DeviceContext, ResultAggregator, ResultSink, RunConfig};
//! use clap::Parser;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = rdma_perf::Args::parse_from(["rdma-perf", "--role", "server", "-t", "4"]);
//!     let config = RunConfig::from_args(&args)?;
//!     let device = DeviceContext::resolve(Some("mlx5_0"), std::path::Path::new("/sys"))?;
//!
//!     let sink = ResultSink::new(Arc::new(ResultAggregator::new()));
//!     let orchestrator = BatchOrchestrator::new(
//!         config.batch_config(&device),
//!         config.core_plan(&device),
//!         config.role,
//!         sink,
//!     );
//!     let (_tx, rx) = tokio::sync::watch::channel(false);
//!     let report = orchestrator.run(rx).await;
//!     println!("{} workers reported", report.successful());
//!     Ok(())
//! }
//! ```

/// Command-line interface
///
/// clap definitions for all options plus the `Role`, `TestType` and
/// `TestMode` enumerations shared by the rest of the crate.
pub mod cli;

/// Benchmark command construction
pub mod command;

/// Validated run configuration and respawn policy
pub mod config;

/// CPU core assignment for worker slots
pub mod cores;

pub mod error;

/// Console and file logging setup
pub mod logging;

/// Prometheus gauges and the pull endpoint
///
/// Each publisher owns its registry. The endpoint is skipped rather than
/// failing when its port is already served by another instance.
pub mod metrics;

/// One-shot batch runs
pub mod orchestrator;

/// perftest output line classifier
///
/// Malformed lines are part of the normal stream and never abort a reader.
pub mod parser;

/// Local TCP port probing
pub mod ports;

/// Result aggregation and persistence
///
/// The aggregator is shared by every reader task, the logger and the
/// metrics path. Absent measurements are never written as zero.
pub mod results;

/// Persistent worker pool with respawn, backoff and a concurrency ceiling
pub mod supervisor;

/// RDMA device and CPU topology discovery
pub mod topology;

/// Worker process launch, output reading and termination
pub mod worker;

pub use cli::{Args, Role, TestMode, TestType};
pub use command::CommandTemplate;
pub use config::{BatchConfig, PortPolicy, RespawnPolicy, RunConfig, SupervisorConfig};
pub use cores::{assign_core, CorePlan};
pub use error::PerfError;
pub use metrics::MetricsPublisher;
pub use orchestrator::{BatchOrchestrator, BatchReport};
pub use parser::{parse_line, OutputParser, ParseEvent};
pub use ports::{find_free_port, is_port_in_use};
pub use results::{LatencySummary, ResultAggregator, ResultLogger, Sample, ThreadResult};
pub use supervisor::{SlotInfo, WorkerSupervisor};
pub use topology::DeviceContext;
pub use worker::{ResultSink, SlotState};

/// The current version of the supervisor
///
/// Populated from Cargo.toml and logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Values follow the settings perftest pools are usually run with on
/// 400 Gb/s links.
pub mod defaults {
    use std::time::Duration;

    /// Default message size in bytes
    pub const MESSAGE_SIZE: usize = 65536;

    /// Default queue depth for bandwidth tests
    pub const QDEPTH: usize = 512;

    /// First worker port
    ///
    /// perftest's own default port. Servers use `BASE_PORT + i`; client `k`
    /// uses `BASE_PORT + k * threads + i`.
    pub const BASE_PORT: u16 = 18515;

    /// Link speed assumed for automatic thread count, in Gb/s
    pub const LINK_SPEED_GBPS: u32 = 400;

    /// Bandwidth one worker is expected to sustain, in Gb/s
    pub const PER_THREAD_GBPS: f64 = 50.0;

    /// Ceiling on concurrently live workers in persistent mode
    pub const MAX_DYNAMIC_THREADS: usize = 64;

    pub const PROMETHEUS_PORT: u16 = 9100;

    pub const LOGS_DIR: &str = "logs";

    /// Pause between consecutive launches in a batch
    ///
    /// Lets each server bind before the next one starts; perftest servers
    /// started in the same instant occasionally fail to bring up their QP.
    pub const LAUNCH_STAGGER: Duration = Duration::from_millis(100);

    /// Added to the client duration before the watchdog kills stragglers
    pub const CLIENT_WATCHDOG_SLACK: Duration = Duration::from_secs(30);

    /// How long output readers get to drain after their process is gone
    pub const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
}
