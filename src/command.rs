//! Benchmark binary invocation.
//!
//! Binaries are selected by `(test type, mode)` and receive the device,
//! transport port, payload size and, in bandwidth mode, queue depth and
//! reporting flags. Clients additionally receive the server address and, in
//! bandwidth mode, the run duration.

use crate::cli::{TestMode, TestType};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

const REPORT_PER_SECOND_FLAG: &str = "--report_per_second";

/// perftest binary name for a test type and mode.
pub fn binary_name(test_type: TestType, mode: TestMode) -> &'static str {
    match (test_type, mode) {
        (TestType::Write, TestMode::Bandwidth) => "ib_write_bw",
        (TestType::Read, TestMode::Bandwidth) => "ib_read_bw",
        (TestType::Send, TestMode::Bandwidth) => "ib_send_bw",
        (TestType::Write, TestMode::Latency) => "ib_write_lat",
        (TestType::Read, TestMode::Latency) => "ib_read_lat",
        (TestType::Send, TestMode::Latency) => "ib_send_lat",
    }
}

/// Everything needed to build a worker command except the port.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub device: String,
    pub test_type: TestType,
    pub mode: TestMode,
    /// HCA port number passed with `-i`.
    pub ib_port: u8,
    pub size: usize,
    pub qdepth: usize,
    /// Client run length; ignored for servers and latency tests.
    pub duration: Option<Duration>,
    /// Present for clients only.
    pub server_ip: Option<String>,
    pub report_gbits: bool,
    pub report_per_second: bool,
    /// Directory holding the binaries; `PATH` lookup when unset.
    pub binary_dir: Option<PathBuf>,
}

impl CommandTemplate {
    pub fn binary(&self) -> &'static str {
        binary_name(self.test_type, self.mode)
    }

    pub fn program(&self) -> PathBuf {
        match &self.binary_dir {
            Some(dir) => dir.join(self.binary()),
            None => PathBuf::from(self.binary()),
        }
    }

    pub fn is_client(&self) -> bool {
        self.server_ip.is_some()
    }

    /// Argument vector for a worker listening on / connecting to `port`.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let mut args = vec!["-d".to_string(), self.device.clone()];
        match self.mode {
            TestMode::Bandwidth => {
                args.extend([
                    "-i".to_string(),
                    self.ib_port.to_string(),
                    "-F".to_string(),
                    "-s".to_string(),
                    self.size.to_string(),
                    "-q".to_string(),
                    self.qdepth.to_string(),
                ]);
                if self.report_gbits {
                    args.push("--report_gbits".to_string());
                }
                if self.report_per_second && self.binary() == "ib_write_bw" {
                    args.push(REPORT_PER_SECOND_FLAG.to_string());
                }
                if let (true, Some(duration)) = (self.is_client(), self.duration) {
                    args.push("--duration".to_string());
                    args.push(duration.as_secs().max(1).to_string());
                }
            }
            TestMode::Latency => {
                args.extend(["-F".to_string(), "-s".to_string(), self.size.to_string()]);
            }
        }
        args.push("--port".to_string());
        args.push(port.to_string());
        if let Some(ip) = &self.server_ip {
            args.push(ip.clone());
        }
        args
    }

    /// Shell-like rendering for log lines.
    pub fn render(&self, port: u16) -> String {
        let mut line = self.program().display().to_string();
        for arg in self.args_for_port(port) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }

    /// Enable `--report_per_second` only when the binary advertises it.
    pub fn probe_report_per_second(&mut self) {
        if self.mode != TestMode::Bandwidth || self.binary() != "ib_write_bw" {
            self.report_per_second = false;
            return;
        }
        self.report_per_second = binary_supports_flag(&self.program().display().to_string(), REPORT_PER_SECOND_FLAG);
        debug!(supported = self.report_per_second, "probed {}", REPORT_PER_SECOND_FLAG);
    }
}

/// Run `<program> --help` and look for `flag` in its combined output.
pub fn binary_supports_flag(program: &str, flag: &str) -> bool {
    match Command::new(program)
        .arg("--help")
        .stdin(Stdio::null())
        .output()
    {
        Ok(out) => {
            String::from_utf8_lossy(&out.stdout).contains(flag)
                || String::from_utf8_lossy(&out.stderr).contains(flag)
        }
        Err(e) => {
            warn!("could not check {} support in {}: {}", flag, program, e);
            false
        }
    }
}
