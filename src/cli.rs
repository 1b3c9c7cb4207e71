use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// RDMA perftest supervisor - runs many pinned ib_*_bw / ib_*_lat workers
/// in parallel and collects their results
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Side of the test this host plays
    #[clap(long, value_enum, help_heading = "Core Options")]
    pub role: Role,

    /// RDMA operation to benchmark
    #[clap(long = "test", value_enum, default_value_t = TestType::Write, help_heading = "Core Options")]
    pub test_type: TestType,

    /// Bandwidth or latency measurement
    #[clap(long, value_enum, default_value_t = TestMode::Bandwidth, help_heading = "Core Options")]
    pub mode: TestMode,

    /// RDMA device name (auto-detected when omitted)
    #[clap(long, help_heading = "Core Options")]
    pub device: Option<String>,

    /// Server address (client role only)
    #[clap(long, help_heading = "Core Options")]
    pub server_ip: Option<String>,

    /// Number of parallel workers (0 derives it from link speed)
    #[clap(short = 't', long, default_value_t = 0, help_heading = "Core Options")]
    pub threads: usize,

    /// Link speed in Gb/s used for automatic thread count
    #[clap(long, default_value_t = crate::defaults::LINK_SPEED_GBPS)]
    pub link_speed: u32,

    /// Expected Gb/s per worker used for automatic thread count
    #[clap(long, default_value_t = crate::defaults::PER_THREAD_GBPS)]
    pub per_thread_gbps: f64,

    /// Queue depth passed to bandwidth binaries
    #[clap(short = 'q', long, default_value_t = crate::defaults::QDEPTH)]
    pub qdepth: usize,

    /// Message size in bytes
    #[clap(short = 's', long, default_value_t = crate::defaults::MESSAGE_SIZE)]
    pub size: usize,

    /// Client test duration (e.g. 60s, 5m)
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "60s")]
    pub duration: Duration,

    /// First TCP port used by workers
    #[clap(long, default_value_t = crate::defaults::BASE_PORT)]
    pub base_port: u16,

    /// Client index; selects this client's port range
    #[clap(long, default_value_t = 0)]
    pub client_id: u16,

    /// HCA port number
    #[clap(long, default_value_t = 1)]
    pub ib_port: u8,

    /// Explicit core list overriding device topology (e.g. 0-3,8)
    #[clap(long)]
    pub cores: Option<String>,

    /// Directory containing the perftest binaries (PATH lookup otherwise)
    #[clap(long)]
    pub binary_dir: Option<PathBuf>,

    /// Do not pass --report_gbits to bandwidth binaries
    #[clap(long, default_value_t = false)]
    pub no_report_gbits: bool,

    /// Write per-thread results as CSV
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub log_csv: bool,

    /// Write per-thread results as JSON
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub log_json: bool,

    /// Directory for result logs
    #[clap(long, default_value = crate::defaults::LOGS_DIR, help_heading = "Output")]
    pub logs_dir: PathBuf,

    /// Keep server workers alive and respawn them when they exit
    #[clap(long, default_value_t = false, help_heading = "Supervision")]
    pub persistent: bool,

    /// Scan upward for free ports instead of using base_port + i verbatim
    #[clap(long, default_value_t = false, help_heading = "Supervision")]
    pub probe_ports: bool,

    /// Interval between supervision passes
    #[clap(long, value_parser = parse_duration, default_value = "5s", help_heading = "Supervision")]
    pub monitor_interval: Duration,

    /// Upper bound on concurrently live workers
    #[clap(long, default_value_t = crate::defaults::MAX_DYNAMIC_THREADS, help_heading = "Supervision")]
    pub max_dynamic_threads: usize,

    /// Quarantine a slot after this many consecutive failed starts
    #[clap(long, help_heading = "Supervision")]
    pub max_respawn_failures: Option<u32>,

    /// Delay before the second consecutive respawn attempt (doubles after)
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Supervision")]
    pub respawn_backoff: Duration,

    /// Ceiling for the respawn delay
    #[clap(long, value_parser = parse_duration, default_value = "60s", help_heading = "Supervision")]
    pub respawn_backoff_max: Duration,

    /// Time between SIGTERM and SIGKILL at shutdown
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Supervision")]
    pub shutdown_grace: Duration,

    /// Expose a Prometheus /metrics endpoint
    #[clap(long, default_value_t = false, help_heading = "Metrics")]
    pub enable_prometheus: bool,

    /// Port for the Prometheus endpoint
    #[clap(long, default_value_t = crate::defaults::PROMETHEUS_PORT, help_heading = "Metrics")]
    pub prometheus_port: u16,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(long, default_value_t = false, conflicts_with = "verbose", help_heading = "Logging")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// RDMA verb exercised by the benchmark
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Write,
    Read,
    Send,
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestType::Write => write!(f, "write"),
            TestType::Read => write!(f, "read"),
            TestType::Send => write!(f, "send"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum TestMode {
    /// Throughput (ib_*_bw)
    #[clap(name = "bw")]
    #[serde(rename = "bw")]
    Bandwidth,

    /// Latency (ib_*_lat)
    #[clap(name = "lat")]
    #[serde(rename = "lat")]
    Latency,
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestMode::Bandwidth => write!(f, "bw"),
            TestMode::Latency => write!(f, "lat"),
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_enum_display() {
        assert_eq!(Role::Server.to_string(), "server");
        assert_eq!(TestType::Send.to_string(), "send");
        assert_eq!(TestMode::Bandwidth.to_string(), "bw");
        assert_eq!(TestMode::Latency.to_string(), "lat");
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["rdma-perf", "--role", "server"]);
        assert_eq!(args.role, Role::Server);
        assert_eq!(args.test_type, TestType::Write);
        assert_eq!(args.mode, TestMode::Bandwidth);
        assert_eq!(args.base_port, 18515);
        assert_eq!(args.qdepth, 512);
        assert_eq!(args.size, 65536);
        assert_eq!(args.duration, Duration::from_secs(60));
        assert_eq!(args.monitor_interval, Duration::from_secs(5));
        assert_eq!(args.max_dynamic_threads, 64);
        assert!(args.max_respawn_failures.is_none());
        assert!(!args.persistent);
    }

    #[test]
    fn test_args_client_lat() {
        let args = Args::parse_from([
            "rdma-perf",
            "--role",
            "client",
            "--test",
            "send",
            "--mode",
            "lat",
            "--server-ip",
            "10.0.0.1",
            "-t",
            "4",
            "-vv",
        ]);
        assert_eq!(args.role, Role::Client);
        assert_eq!(args.test_type, TestType::Send);
        assert_eq!(args.mode, TestMode::Latency);
        assert_eq!(args.server_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(args.threads, 4);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["rdma-perf", "--role", "server", "-v", "--quiet"]).is_err());
    }
}
