//! Persistent worker pool.
//!
//! The supervisor is the only respawn authority: launched commands never
//! loop on their own. Each monitor tick reaps exited workers, relaunches the
//! slots whose backoff has elapsed with their original `(core, port, binary)`,
//! and then fills deferred slots while the ceiling allows. A slot waiting out
//! its backoff keeps its place under the ceiling; a quarantined slot gives it
//! up.
//!
//! Exited workers are retired rather than dropped: children that outlive the
//! leader still hold the process group and the output pipe, so shutdown
//! signals every retired group and joins its reader too.
//!
//! Slot state lives behind one mutex that is never held across an await.

use crate::cli::{TestMode, TestType};
use crate::config::{PortPolicy, SupervisorConfig};
use crate::cores::CorePlan;
use crate::error::PerfError;
use crate::ports::find_free_port;
use crate::results::WorkerIdentity;
use crate::worker::{describe_exit, join_readers, terminate_all, ResultSink, SlotState, WorkerProcess};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// One supervised worker and its respawn bookkeeping.
pub struct WorkerSlot {
    pub port: u16,
    pub core: usize,
    pub binary: String,
    pub test_type: TestType,
    pub mode: TestMode,
    pin: bool,
    /// State while no process is attached.
    idle_state: SlotState,
    process: Option<WorkerProcess>,
    pub respawn_count: u32,
    pub consecutive_failures: u32,
    next_attempt: Instant,
    pub last_exit: Option<String>,
}

impl WorkerSlot {
    pub fn state(&self) -> SlotState {
        match &self.process {
            Some(p) => p.state(),
            None => self.idle_state,
        }
    }

    fn is_live(&self) -> bool {
        self.process.is_some()
    }

    /// Counts against `max_dynamic_threads`: running, or due for a relaunch.
    fn holds_capacity(&self) -> bool {
        self.is_live() || self.idle_state == SlotState::Dead
    }

    fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            thread_id: u32::from(self.port),
            port: self.port,
            core: self.core,
            binary: self.binary.clone(),
        }
    }

    fn info(&self) -> SlotInfo {
        SlotInfo {
            port: self.port,
            core: self.core,
            binary: self.binary.clone(),
            state: self.state(),
            respawn_count: self.respawn_count,
            consecutive_failures: self.consecutive_failures,
            pid: self.process.as_ref().map(WorkerProcess::pid),
            last_exit: self.last_exit.clone(),
        }
    }
}

/// Read-only view of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub port: u16,
    pub core: usize,
    pub binary: String,
    pub state: SlotState,
    pub respawn_count: u32,
    pub consecutive_failures: u32,
    pub pid: Option<u32>,
    pub last_exit: Option<String>,
}

/// What one monitor pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub exited: usize,
    pub respawned: usize,
    pub launch_failures: usize,
    pub quarantined: usize,
    pub started: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub terminated: usize,
    pub killed: usize,
    pub stuck_readers: usize,
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    plan: CorePlan,
    sink: ResultSink,
    slots: Mutex<BTreeMap<u16, WorkerSlot>>,
    /// Worker indices waiting for capacity under the ceiling.
    pending: Mutex<VecDeque<usize>>,
    next_index: Mutex<usize>,
    /// Exited workers whose group or reader has not finished yet.
    retired: Mutex<Vec<WorkerProcess>>,
    stopping: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig, plan: CorePlan, sink: ResultSink) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            plan,
            sink,
            slots: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(VecDeque::new()),
            next_index: Mutex::new(0),
            retired: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    /// Queue `count` more workers and launch as many as the ceiling allows.
    /// Returns how many started now.
    pub fn schedule(&self, count: usize) -> usize {
        {
            let mut next = self.next_index.lock();
            let mut pending = self.pending.lock();
            pending.extend(*next..*next + count);
            *next += count;
        }
        let mut report = TickReport::default();
        self.fill_pending(&mut report);
        if report.deferred > 0 {
            info!(
                "{} workers deferred by the {}-worker ceiling",
                report.deferred, self.config.max_dynamic_threads
            );
        }
        report.started
    }

    fn port_for(&self, index: usize, slots: &BTreeMap<u16, WorkerSlot>) -> Result<u16, PerfError> {
        let candidate = u16::try_from(usize::from(self.config.base_port) + index)
            .map_err(|_| PerfError::NoFreePort { start: self.config.base_port })?;
        match self.config.port_policy {
            PortPolicy::Fixed => {
                if slots.contains_key(&candidate) {
                    return Err(PerfError::NoFreePort { start: candidate });
                }
                Ok(candidate)
            }
            PortPolicy::Probe => {
                let mut start = candidate;
                loop {
                    let port = find_free_port(start)?;
                    if !slots.contains_key(&port) {
                        return Ok(port);
                    }
                    start = port
                        .checked_add(1)
                        .ok_or(PerfError::NoFreePort { start: candidate })?;
                }
            }
        }
    }

    fn fill_pending(&self, report: &mut TickReport) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let mut slots = self.slots.lock();
        let mut pending = self.pending.lock();
        let mut occupied = slots.values().filter(|s| s.holds_capacity()).count();
        let mut retry = VecDeque::new();

        while occupied < self.config.max_dynamic_threads {
            let Some(index) = pending.pop_front() else { break };
            let port = match self.port_for(index, &slots) {
                Ok(port) => port,
                Err(e) => {
                    error!("Worker {}: {}", index, e);
                    retry.push_back(index);
                    continue;
                }
            };
            let core = self.plan.core_for(index);
            let pin = self.plan.is_pinnable(core);
            if !pin {
                warn!("Core {} is not in the allowed set; port {} runs unpinned", core, port);
            }
            let mut slot = WorkerSlot {
                port,
                core,
                binary: self.config.template.binary().to_string(),
                test_type: self.config.template.test_type,
                mode: self.config.template.mode,
                pin,
                idle_state: SlotState::Dead,
                process: None,
                respawn_count: 0,
                consecutive_failures: 0,
                next_attempt: Instant::now(),
                last_exit: None,
            };
            if let Some(m) = self.sink.metrics() {
                m.register_slot(port, core, &slot.binary);
                m.set_respawns(port, 0);
            }
            if self.launch(&mut slot, report) {
                report.started += 1;
            }
            if slot.holds_capacity() {
                occupied += 1;
            }
            slots.insert(port, slot);
        }

        report.deferred = pending.len();
        pending.extend(retry);
    }

    /// Start the slot's process. On failure the slot stays `Dead` until its
    /// backoff elapses, or becomes `Quarantined`.
    fn launch(&self, slot: &mut WorkerSlot, report: &mut TickReport) -> bool {
        match WorkerProcess::spawn(&self.config.template, slot.identity(), slot.pin, &self.sink) {
            Ok(process) => {
                slot.process = Some(process);
                true
            }
            Err(e) => {
                error!("{}", e);
                report.launch_failures += 1;
                slot.last_exit = Some(format!("launch failed: {}", e));
                self.record_failure(slot, report);
                false
            }
        }
    }

    fn record_failure(&self, slot: &mut WorkerSlot, report: &mut TickReport) {
        slot.consecutive_failures += 1;
        let policy = &self.config.respawn;
        if policy.should_quarantine(slot.consecutive_failures) {
            error!(
                "Port {} quarantined after {} consecutive failures",
                slot.port, slot.consecutive_failures
            );
            slot.idle_state = SlotState::Quarantined;
            report.quarantined += 1;
            return;
        }
        let delay = policy.backoff_delay(slot.consecutive_failures);
        if !delay.is_zero() {
            warn!("Port {} failed {} times in a row; retrying in {:?}", slot.port, slot.consecutive_failures, delay);
        }
        slot.idle_state = SlotState::Dead;
        slot.next_attempt = Instant::now() + delay;
    }

    /// One supervision pass: reap exits, respawn due slots, fill deferred
    /// slots. Does nothing once shutdown has begun.
    pub fn monitor_tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.stopping.load(Ordering::SeqCst) {
            return report;
        }

        let mut exited = Vec::new();
        {
            let mut slots = self.slots.lock();
            for slot in slots.values_mut() {
                if let Some(process) = slot.process.as_mut() {
                    match process.try_wait() {
                        Ok(None) => continue,
                        Ok(Some(status)) => {
                            let reached_running = process.reached_running();
                            exited.extend(slot.process.take());
                            slot.respawn_count += 1;
                            slot.last_exit = Some(describe_exit(status));
                            report.exited += 1;
                            info!(
                                "Worker on port {} exited ({}); respawn #{}",
                                slot.port,
                                describe_exit(status),
                                slot.respawn_count
                            );
                            if let Some(m) = self.sink.metrics() {
                                m.set_respawns(slot.port, slot.respawn_count);
                            }
                            if reached_running {
                                slot.consecutive_failures = 0;
                                slot.idle_state = SlotState::Dead;
                                slot.next_attempt = Instant::now();
                            } else {
                                self.record_failure(slot, &mut report);
                            }
                        }
                        Err(e) => {
                            warn!("Failed to poll worker on port {}: {}", slot.port, e);
                            continue;
                        }
                    }
                }

                if slot.idle_state == SlotState::Dead && Instant::now() >= slot.next_attempt {
                    debug!("Relaunching port {} on core {}", slot.port, slot.core);
                    if self.launch(slot, &mut report) {
                        report.respawned += 1;
                    }
                }
            }
        }

        self.retire(exited);
        self.fill_pending(&mut report);
        if let Some(m) = self.sink.metrics() {
            m.set_active(self.active_count());
        }
        report
    }

    /// Park exited workers until their group is empty and their reader has
    /// hit EOF.
    fn retire(&self, exited: Vec<WorkerProcess>) {
        let mut retired = self.retired.lock();
        retired.extend(exited);
        retired.retain_mut(|w| !(w.is_drained() && w.is_gone()));
    }

    /// Exited workers still waiting on leftover children or their reader.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Slots with a live process.
    pub fn active_count(&self) -> usize {
        self.slots.lock().values().filter(|s| s.is_live()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn slot_infos(&self) -> Vec<SlotInfo> {
        self.slots.lock().values().map(WorkerSlot::info).collect()
    }

    pub fn slot_info(&self, port: u16) -> Option<SlotInfo> {
        self.slots.lock().get(&port).map(WorkerSlot::info)
    }

    /// Spawn the monitor loop and the active-count gauge loop. Both stop when
    /// [`shutdown`](Self::shutdown) runs.
    pub fn start_background(self: &Arc<Self>) {
        let interval = self.config.monitor_interval;

        let monitor = {
            let this = Arc::clone(self);
            let stop = self.stop_tx.subscribe();
            tokio::spawn(async move { this.run_monitor(stop).await })
        };

        let gauges = {
            let this = Arc::clone(self);
            let mut stop = self.stop_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Some(m) = this.sink.metrics() {
                                m.set_active(this.active_count());
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            })
        };

        self.tasks.lock().extend([monitor, gauges]);
    }

    async fn run_monitor(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; slots were just launched.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.monitor_tick();
                    if report != TickReport::default() {
                        debug!(?report, "monitor pass");
                    }
                }
                _ = stop.changed() => break,
            }
        }
        debug!("Monitor loop stopped");
    }

    /// Stop respawning, terminate every worker and join all tasks.
    ///
    /// Slots are removed; call [`slot_infos`](Self::slot_infos) first if the
    /// final view is needed. Results already in the aggregator are kept.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }

        let mut processes: Vec<WorkerProcess> = {
            let mut slots = self.slots.lock();
            let taken = slots.values_mut().filter_map(|s| s.process.take()).collect();
            slots.clear();
            taken
        };
        self.pending.lock().clear();

        let terminated = processes.len();
        let retired = std::mem::take(&mut *self.retired.lock());
        info!("Stopping {} workers ({} exited groups to clean up)", terminated, retired.len());
        processes.extend(retired);
        let killed = terminate_all(&mut processes, self.config.shutdown_grace).await;
        let stuck_readers = join_readers(&mut processes, crate::defaults::READER_JOIN_TIMEOUT).await;

        if let Some(m) = self.sink.metrics() {
            m.set_active(0);
        }

        ShutdownReport {
            terminated,
            killed,
            stuck_readers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTemplate;
    use crate::config::RespawnPolicy;
    use crate::results::ResultAggregator;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    fn script(dir: &Path, body: &str) {
        let path = dir.join("ib_write_bw");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn supervisor(dir: &Path, base_port: u16, ceiling: usize, respawn: RespawnPolicy) -> WorkerSupervisor {
        let config = SupervisorConfig {
            template: CommandTemplate {
                device: "mlx5_0".into(),
                test_type: TestType::Write,
                mode: TestMode::Bandwidth,
                ib_port: 1,
                size: 4096,
                qdepth: 16,
                duration: None,
                server_ip: None,
                report_gbits: false,
                report_per_second: false,
                binary_dir: Some(dir.to_path_buf()),
            },
            base_port,
            port_policy: PortPolicy::Fixed,
            monitor_interval: Duration::from_millis(50),
            max_dynamic_threads: ceiling,
            respawn,
            shutdown_grace: Duration::from_millis(500),
        };
        let plan = CorePlan::new(&[], 4);
        WorkerSupervisor::new(config, plan, ResultSink::new(Arc::new(ResultAggregator::new())))
    }

    #[tokio::test]
    async fn test_ceiling_defers_slots() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "exec sleep 30");
        let sup = supervisor(dir.path(), 21000, 2, RespawnPolicy::immediate());

        assert_eq!(sup.schedule(3), 2);
        assert_eq!(sup.active_count(), 2);
        assert_eq!(sup.pending_count(), 1);

        let report = sup.shutdown().await;
        assert_eq!(report.terminated, 2);
        assert!(sup.slot_infos().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failures_back_off_then_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        // No binary in the directory: every launch fails.
        let policy = RespawnPolicy {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_consecutive_failures: Some(3),
        };
        let sup = supervisor(dir.path(), 21100, 4, policy);

        assert_eq!(sup.schedule(1), 0);
        let info = sup.slot_info(21100).unwrap();
        assert_eq!(info.state, SlotState::Dead);
        assert_eq!(info.consecutive_failures, 1);

        sup.monitor_tick();
        let report = sup.monitor_tick();
        assert_eq!(report.quarantined, 1);
        let info = sup.slot_info(21100).unwrap();
        assert_eq!(info.state, SlotState::Quarantined);
        assert_eq!(info.respawn_count, 0);

        let report = sup.monitor_tick();
        assert_eq!(report.launch_failures, 0);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_quarantine_releases_ceiling_place() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RespawnPolicy {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_consecutive_failures: Some(1),
        };
        let sup = supervisor(dir.path(), 21400, 1, policy);

        // Each failed slot is quarantined at once, so the next one gets its place.
        assert_eq!(sup.schedule(2), 0);
        assert_eq!(sup.pending_count(), 0);
        let states: Vec<SlotState> = sup.slot_infos().iter().map(|s| s.state).collect();
        assert_eq!(states, vec![SlotState::Quarantined, SlotState::Quarantined]);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_slot_keeps_ceiling_place() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RespawnPolicy {
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            max_consecutive_failures: None,
        };
        let sup = supervisor(dir.path(), 21500, 1, policy);

        assert_eq!(sup.schedule(2), 0);
        assert_eq!(sup.slot_infos().len(), 1);
        assert_eq!(sup.pending_count(), 1);
        sup.monitor_tick();
        assert_eq!(sup.slot_infos().len(), 1);
        assert_eq!(sup.pending_count(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_backoff_delays_retry() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RespawnPolicy {
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            max_consecutive_failures: None,
        };
        let sup = supervisor(dir.path(), 21200, 4, policy);
        sup.schedule(1);
        // Second failure arms a 60s delay; the next tick must not retry.
        assert_eq!(sup.monitor_tick().launch_failures, 1);
        assert_eq!(sup.monitor_tick().launch_failures, 0);
        assert_eq!(sup.slot_info(21200).unwrap().consecutive_failures, 2);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_ticks_after_shutdown_do_nothing() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "exit 0");
        let sup = supervisor(dir.path(), 21300, 4, RespawnPolicy::immediate());
        sup.schedule(2);
        sup.shutdown().await;
        assert_eq!(sup.monitor_tick(), TickReport::default());
        assert_eq!(sup.schedule(1), 0);
    }
}
