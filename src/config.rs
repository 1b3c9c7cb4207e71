//! Run-time configuration.
//!
//! [`RunConfig`] is the validated form of the command line. The narrower
//! [`SupervisorConfig`] and [`BatchConfig`] are what the engines consume;
//! they are plain structs so library users and tests can build them directly.

use crate::cli::{Args, Role, TestMode, TestType};
use crate::command::CommandTemplate;
use crate::cores::{parse_core_list, CorePlan};
use crate::error::PerfError;
use crate::ports::PORT_CEILING;
use crate::results::ResultLogger;
use crate::topology::DeviceContext;
use std::path::PathBuf;
use std::time::Duration;

/// How slot ports are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    /// `base + i`, used verbatim. A busy port surfaces as a launch failure.
    Fixed,
    /// Scan upward from the next candidate for a port that binds.
    Probe,
}

/// Delay and quarantine rules for slots that keep failing to start.
///
/// A failure is an exit before the worker produced any parsed output, or a
/// launch error. A run that reached `Running` resets the streak.
#[derive(Debug, Clone, PartialEq)]
pub struct RespawnPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Quarantine after this many consecutive failures; `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_consecutive_failures: None,
        }
    }
}

impl RespawnPolicy {
    /// No delay and no quarantine.
    pub fn immediate() -> Self {
        Self {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_consecutive_failures: None,
        }
    }

    /// Wait before retrying after `failures` consecutive failures.
    ///
    /// The first failure retries on the next tick; each further one doubles
    /// the delay from `base_backoff` up to `max_backoff`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return Duration::ZERO;
        }
        let base_secs = self.base_backoff.as_secs_f64();
        let max_secs = self.max_backoff.as_secs_f64().max(0.0);
        let multiplier = 2_u32.saturating_pow(failures - 2) as f64;
        Duration::from_secs_f64((base_secs * multiplier).min(max_secs))
    }

    pub fn should_quarantine(&self, failures: u32) -> bool {
        self.max_consecutive_failures
            .is_some_and(|max| failures >= max.max(1))
    }
}

/// Inputs for a persistent [`WorkerSupervisor`](crate::supervisor::WorkerSupervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub template: CommandTemplate,
    pub base_port: u16,
    pub port_policy: PortPolicy,
    pub monitor_interval: Duration,
    /// Ceiling on concurrently live workers; extra slots wait their turn.
    pub max_dynamic_threads: usize,
    pub respawn: RespawnPolicy,
    pub shutdown_grace: Duration,
}

/// Inputs for a one-shot [`BatchOrchestrator`](crate::orchestrator::BatchOrchestrator).
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub template: CommandTemplate,
    pub ports: Vec<u16>,
    pub launch_stagger: Duration,
    /// Kill workers still running after this long. Unset for servers.
    pub watchdog: Option<Duration>,
    pub shutdown_grace: Duration,
    pub reader_join_timeout: Duration,
}

/// Validated command-line configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub role: Role,
    pub test_type: TestType,
    pub mode: TestMode,
    pub device: Option<String>,
    pub server_ip: Option<String>,
    pub threads: usize,
    pub qdepth: usize,
    pub size: usize,
    pub duration: Duration,
    pub base_port: u16,
    pub client_id: u16,
    pub ib_port: u8,
    pub core_override: Option<Vec<usize>>,
    pub binary_dir: Option<PathBuf>,
    pub report_gbits: bool,
    pub log_csv: bool,
    pub log_json: bool,
    pub logs_dir: PathBuf,
    pub persistent: bool,
    pub port_policy: PortPolicy,
    pub monitor_interval: Duration,
    pub max_dynamic_threads: usize,
    pub respawn: RespawnPolicy,
    pub shutdown_grace: Duration,
    pub enable_prometheus: bool,
    pub prometheus_port: u16,
}

/// Workers needed to fill a link: `max(1, link / per_thread)`.
pub fn auto_thread_count(link_speed_gbps: u32, per_thread_gbps: f64) -> Result<usize, PerfError> {
    if !per_thread_gbps.is_finite() || per_thread_gbps <= 0.0 {
        return Err(PerfError::InvalidConfig(format!(
            "--per-thread-gbps must be positive, got {}",
            per_thread_gbps
        )));
    }
    Ok(((f64::from(link_speed_gbps) / per_thread_gbps) as usize).max(1))
}

impl RunConfig {
    pub fn from_args(args: &Args) -> Result<Self, PerfError> {
        let server_ip = args.server_ip.clone().filter(|ip| !ip.trim().is_empty());
        match args.role {
            Role::Client if server_ip.is_none() => {
                return Err(PerfError::InvalidConfig(
                    "client role requires --server-ip".into(),
                ))
            }
            Role::Client if args.persistent => {
                return Err(PerfError::InvalidConfig(
                    "--persistent is only valid for the server role".into(),
                ))
            }
            Role::Server if server_ip.is_some() => {
                return Err(PerfError::InvalidConfig(
                    "--server-ip is only valid for the client role".into(),
                ))
            }
            _ => {}
        }

        let threads = match args.threads {
            0 => auto_thread_count(args.link_speed, args.per_thread_gbps)?,
            n => n,
        };
        if args.max_dynamic_threads == 0 {
            return Err(PerfError::InvalidConfig(
                "--max-dynamic-threads must be at least 1".into(),
            ));
        }
        if args.size == 0 {
            return Err(PerfError::InvalidConfig("--size must be positive".into()));
        }
        if args.respawn_backoff > args.respawn_backoff_max {
            return Err(PerfError::InvalidConfig(
                "--respawn-backoff exceeds --respawn-backoff-max".into(),
            ));
        }

        let core_override = args
            .cores
            .as_deref()
            .map(parse_core_list)
            .transpose()
            .map_err(|e| PerfError::InvalidConfig(e.to_string()))?
            .filter(|cores| !cores.is_empty());

        let config = Self {
            role: args.role,
            test_type: args.test_type,
            mode: args.mode,
            device: args.device.clone(),
            server_ip,
            threads,
            qdepth: args.qdepth,
            size: args.size,
            duration: args.duration,
            base_port: args.base_port,
            client_id: args.client_id,
            ib_port: args.ib_port,
            core_override,
            binary_dir: args.binary_dir.clone(),
            report_gbits: !args.no_report_gbits,
            log_csv: args.log_csv,
            log_json: args.log_json,
            logs_dir: args.logs_dir.clone(),
            persistent: args.persistent,
            port_policy: if args.probe_ports {
                PortPolicy::Probe
            } else {
                PortPolicy::Fixed
            },
            monitor_interval: args.monitor_interval.max(Duration::from_millis(10)),
            max_dynamic_threads: args.max_dynamic_threads,
            respawn: RespawnPolicy {
                base_backoff: args.respawn_backoff,
                max_backoff: args.respawn_backoff_max,
                max_consecutive_failures: args.max_respawn_failures,
            },
            shutdown_grace: args.shutdown_grace,
            enable_prometheus: args.enable_prometheus,
            prometheus_port: args.prometheus_port,
        };
        config.port_span()?;
        Ok(config)
    }

    /// First port of this invocation's range.
    fn first_port(&self) -> u64 {
        let offset = match self.role {
            Role::Server => 0,
            Role::Client => u64::from(self.client_id) * self.threads as u64,
        };
        u64::from(self.base_port) + offset
    }

    fn port_span(&self) -> Result<(u16, u16), PerfError> {
        let first = self.first_port();
        let last = first + self.threads as u64 - 1;
        if self.base_port == 0 || last >= u64::from(PORT_CEILING) {
            return Err(PerfError::InvalidConfig(format!(
                "port range {}..={} does not fit below {}",
                first, last, PORT_CEILING
            )));
        }
        Ok((first as u16, last as u16))
    }

    /// `base + i` for a server, `base + client_id * threads + i` for a client.
    pub fn worker_ports(&self) -> Vec<u16> {
        match self.port_span() {
            Ok((first, last)) => (first..=last).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Identifier used in result file names.
    pub fn run_id(&self) -> String {
        match self.role {
            Role::Server => format!("{}_{}", self.base_port, self.threads),
            Role::Client => self.client_id.to_string(),
        }
    }

    pub fn template(&self, device: &DeviceContext) -> CommandTemplate {
        CommandTemplate {
            device: device.device_name.clone(),
            test_type: self.test_type,
            mode: self.mode,
            ib_port: self.ib_port,
            size: self.size,
            qdepth: self.qdepth,
            duration: Some(self.duration),
            server_ip: self.server_ip.clone(),
            report_gbits: self.report_gbits,
            report_per_second: false,
            binary_dir: self.binary_dir.clone(),
        }
    }

    pub fn core_plan(&self, device: &DeviceContext) -> CorePlan {
        match &self.core_override {
            Some(cores) => CorePlan::new(cores, self.threads),
            None => CorePlan::new(&device.cpu_cores, self.threads),
        }
    }

    pub fn supervisor_config(&self, device: &DeviceContext) -> SupervisorConfig {
        SupervisorConfig {
            template: self.template(device),
            base_port: self.base_port,
            port_policy: self.port_policy,
            monitor_interval: self.monitor_interval,
            max_dynamic_threads: self.max_dynamic_threads,
            respawn: self.respawn.clone(),
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn batch_config(&self, device: &DeviceContext) -> BatchConfig {
        BatchConfig {
            template: self.template(device),
            ports: self.worker_ports(),
            launch_stagger: crate::defaults::LAUNCH_STAGGER,
            watchdog: match self.role {
                Role::Client => Some(self.duration + crate::defaults::CLIENT_WATCHDOG_SLACK),
                Role::Server => None,
            },
            shutdown_grace: self.shutdown_grace,
            reader_join_timeout: crate::defaults::READER_JOIN_TIMEOUT,
        }
    }

    pub fn logger(&self) -> ResultLogger {
        ResultLogger::new(&self.logs_dir, self.log_csv, self.log_json)
    }
}
