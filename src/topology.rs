//! Device context resolution from sysfs.

use crate::cores::parse_core_list;
use crate::error::PerfError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Resolved RDMA device. Read-only for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContext {
    pub device_name: String,
    pub interface_name: Option<String>,
    pub numa_node: Option<u32>,
    pub cpu_cores: Vec<usize>,
}

impl DeviceContext {
    /// A context with no topology information; the core planner falls back.
    pub fn named(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            interface_name: None,
            numa_node: None,
            cpu_cores: Vec::new(),
        }
    }

    /// Resolve `device` (or the first device with a network interface) under
    /// `<sysfs_root>/class/infiniband`.
    pub fn resolve(device: Option<&str>, sysfs_root: &Path) -> Result<Self, PerfError> {
        let base = sysfs_root.join("class").join("infiniband");
        let device_name = match device {
            Some(name) => {
                if !base.join(name).is_dir() {
                    return Err(PerfError::DeviceUnavailable(format!(
                        "{} not found under {}",
                        name,
                        base.display()
                    )));
                }
                name.to_string()
            }
            None => first_device_with_netdev(&base)?,
        };

        let dev_dir = base.join(&device_name).join("device");
        let interface_name = first_entry(&dev_dir.join("net"));
        let numa_node = read_trimmed(&dev_dir.join("numa_node"))
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|n| u32::try_from(n).ok());

        let cpu_cores = match read_trimmed(&dev_dir.join("local_cpulist")) {
            Some(list) => parse_core_list(&list).unwrap_or_else(|e| {
                warn!("{}: {}", device_name, e);
                Vec::new()
            }),
            None => {
                warn!(
                    "{}",
                    PerfError::TopologyUnavailable(format!("no local_cpulist for {}", device_name))
                );
                Vec::new()
            }
        };

        debug!(
            device = %device_name,
            interface = ?interface_name,
            numa = ?numa_node,
            cores = cpu_cores.len(),
            "resolved device context"
        );

        Ok(Self {
            device_name,
            interface_name,
            numa_node,
            cpu_cores,
        })
    }
}

fn first_device_with_netdev(base: &Path) -> Result<String, PerfError> {
    let entries = fs::read_dir(base)
        .map_err(|e| PerfError::DeviceUnavailable(format!("{}: {}", base.display(), e)))?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
        .into_iter()
        .find(|name| base.join(name).join("device").join("net").is_dir())
        .ok_or_else(|| PerfError::DeviceUnavailable("no RDMA device with a network interface".into()))
}

fn first_entry(dir: &Path) -> Option<String> {
    let mut names: Vec<PathBuf> = fs::read_dir(dir).ok()?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    names.sort();
    names
        .first()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
