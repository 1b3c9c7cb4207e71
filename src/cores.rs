//! CPU core assignment for worker slots.
//!
//! Assignment is round-robin over the device's local core list. An empty list
//! is not an error: the planner falls back to a synthetic range so every
//! worker still gets a core when topology detection fails.

use crate::error::PerfError;
use std::collections::BTreeSet;
use tracing::warn;

/// Core for worker `index`: `cores[index mod len]`, or `index mod nproc`
/// when `cores` is empty.
pub fn assign_core(index: usize, cores: &[usize]) -> usize {
    if cores.is_empty() {
        return index % num_cpus::get().max(1);
    }
    cores[index % cores.len()]
}

/// Cores this process may pin children to, as reported by the scheduler.
pub fn pinnable_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|c| c.id).collect())
        .unwrap_or_default()
}

/// Parse a kernel cpulist such as `0-3,8,10-11`.
pub fn parse_core_list(list: &str) -> Result<Vec<usize>, PerfError> {
    let mut cores = BTreeSet::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bad = || PerfError::TopologyUnavailable(format!("bad cpulist entry '{}'", part));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| bad())?;
                let hi: usize = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                cores.extend(lo..=hi);
            }
            None => {
                cores.insert(part.parse().map_err(|_| bad())?);
            }
        }
    }
    Ok(cores.into_iter().collect())
}

/// Resolved core list for one run plus the set of cores pinning can use.
#[derive(Debug, Clone)]
pub struct CorePlan {
    cores: Vec<usize>,
    pinnable: BTreeSet<usize>,
}

impl CorePlan {
    /// Build a plan from the device's cores, falling back to the pinnable set
    /// and then to `[0, thread_count)`.
    pub fn new(device_cores: &[usize], thread_count: usize) -> Self {
        let pinnable: BTreeSet<usize> = pinnable_cores().into_iter().collect();
        let cores = if !device_cores.is_empty() {
            device_cores.to_vec()
        } else if !pinnable.is_empty() {
            warn!("device core list empty; using all {} schedulable cores", pinnable.len());
            pinnable.iter().copied().collect()
        } else {
            warn!("no topology information; using synthetic cores 0..{}", thread_count.max(1));
            (0..thread_count.max(1)).collect()
        };
        Self { cores, pinnable }
    }

    pub fn core_for(&self, index: usize) -> usize {
        assign_core(index, &self.cores)
    }

    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    /// Whether pinning a child to `core` can succeed. An unknown pinnable set
    /// means the scheduler could not be queried; pinning is then attempted anyway.
    pub fn is_pinnable(&self, core: usize) -> bool {
        self.pinnable.is_empty() || self.pinnable.contains(&core)
    }
}
