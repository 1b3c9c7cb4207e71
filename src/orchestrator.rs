//! One-shot runs.
//!
//! Launches one worker per configured port, waits for every process to exit
//! and returns whatever the readers captured. An interrupt or the client
//! watchdog ends the wait early; the workers are terminated and the partial
//! results are still reported.

use crate::cli::Role;
use crate::config::BatchConfig;
use crate::cores::CorePlan;
use crate::results::{LatencySummary, ThreadResult, WorkerIdentity};
use crate::worker::{describe_exit, join_readers, terminate_all, ResultSink, WorkerProcess};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEnd {
    Completed,
    Interrupted,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerOutcome {
    pub thread_id: u32,
    pub port: u16,
    pub core: usize,
    pub pid: Option<u32>,
    /// Exit description, or the launch error for workers that never started.
    pub exit: Option<String>,
    pub launch_failed: bool,
    pub reached_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub end: BatchEnd,
    pub outcomes: Vec<WorkerOutcome>,
    pub results: Vec<ThreadResult>,
    pub latency_summary: Option<LatencySummary>,
}

impl BatchReport {
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.sample.is_some()).count()
    }
}

pub struct BatchOrchestrator {
    config: BatchConfig,
    plan: CorePlan,
    role: Role,
    sink: ResultSink,
}

impl BatchOrchestrator {
    pub fn new(config: BatchConfig, plan: CorePlan, role: Role, sink: ResultSink) -> Self {
        Self {
            config,
            plan,
            role,
            sink,
        }
    }

    /// Servers key results by port, clients by worker index.
    fn thread_id(&self, index: usize, port: u16) -> u32 {
        match self.role {
            Role::Server => u32::from(port),
            Role::Client => index as u32,
        }
    }

    /// Run one batch to completion, interrupt, or watchdog expiry.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BatchReport {
        self.sink.aggregator().clear();
        let started_at = Instant::now();
        let mut outcomes = Vec::with_capacity(self.config.ports.len());
        let mut workers: Vec<(usize, WorkerProcess)> = Vec::new();
        let mut end = BatchEnd::Completed;

        for (index, &port) in self.config.ports.iter().enumerate() {
            if *shutdown.borrow() {
                end = BatchEnd::Interrupted;
                break;
            }
            if index > 0 && !self.config.launch_stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.launch_stagger) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    end = BatchEnd::Interrupted;
                    break;
                }
            }

            let core = self.plan.core_for(index);
            let pin = self.plan.is_pinnable(core);
            if !pin {
                warn!("Core {} is not in the allowed set; port {} runs unpinned", core, port);
            }
            let identity = WorkerIdentity {
                thread_id: self.thread_id(index, port),
                port,
                core,
                binary: self.config.template.binary().to_string(),
            };
            match WorkerProcess::spawn(&self.config.template, identity.clone(), pin, &self.sink) {
                Ok(process) => {
                    outcomes.push(WorkerOutcome {
                        thread_id: identity.thread_id,
                        port,
                        core,
                        pid: Some(process.pid()),
                        exit: None,
                        launch_failed: false,
                        reached_running: false,
                    });
                    workers.push((outcomes.len() - 1, process));
                }
                Err(e) => {
                    error!("{}", e);
                    outcomes.push(WorkerOutcome {
                        thread_id: identity.thread_id,
                        port,
                        core,
                        pid: None,
                        exit: Some(e.to_string()),
                        launch_failed: true,
                        reached_running: false,
                    });
                }
            }
        }
        info!("Launched {} of {} workers", workers.len(), self.config.ports.len());

        if end == BatchEnd::Completed {
            end = self.wait_all(&mut workers, &mut shutdown, started_at).await;
        }

        let (slots, mut processes): (Vec<usize>, Vec<WorkerProcess>) = workers.into_iter().unzip();
        if end != BatchEnd::Completed {
            warn!("Batch {:?}; terminating remaining workers", end);
        }
        // Also reaches children left behind by workers that already exited.
        let killed = terminate_all(&mut processes, self.config.shutdown_grace).await;
        if killed > 0 {
            warn!("{} worker groups had to be killed", killed);
        }
        let stuck = join_readers(&mut processes, self.config.reader_join_timeout).await;
        if stuck > 0 {
            warn!("{} output readers still blocked; using results captured so far", stuck);
        }

        for (slot, process) in slots.into_iter().zip(processes.iter()) {
            let outcome = &mut outcomes[slot];
            outcome.reached_running = process.reached_running();
            outcome.exit = process.exit_status().map(describe_exit);
        }

        let results = self.sink.aggregator().snapshot();
        let latency_summary = LatencySummary::from_results(&results);
        BatchReport {
            end,
            outcomes,
            results,
            latency_summary,
        }
    }

    async fn wait_all(
        &self,
        workers: &mut [(usize, WorkerProcess)],
        shutdown: &mut watch::Receiver<bool>,
        started_at: Instant,
    ) -> BatchEnd {
        let deadline = self.config.watchdog.map(|limit| started_at + limit);
        let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);

        loop {
            let mut running = 0;
            for (_, process) in workers.iter_mut() {
                match process.try_wait() {
                    Ok(Some(_)) => {}
                    Ok(None) => running += 1,
                    Err(e) => warn!("Failed to poll port {}: {}", process.identity().port, e),
                }
            }
            if running == 0 {
                return BatchEnd::Completed;
            }

            let watchdog = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = ticker.tick() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Interrupted with {} workers running", running);
                        return BatchEnd::Interrupted;
                    }
                }
                _ = watchdog => {
                    warn!("Watchdog expired with {} workers running", running);
                    return BatchEnd::TimedOut;
                }
            }
        }
    }
}
