//! One benchmark process and the task that reads its output.
//!
//! Each worker is started in its own process group with stdout and stderr
//! merged into a single pipe. A blocking reader drains that pipe line by line
//! into the [`OutputParser`] and pushes every event to the shared
//! [`ResultSink`]. The reader is the only writer for its worker's key, so
//! updates for one worker are totally ordered.
//!
//! Termination signals the whole group (SIGTERM, a grace period, then
//! SIGKILL) so shell wrappers and their children go down together, and the
//! pipe reaches EOF once every holder of the write end is gone.

use crate::command::CommandTemplate;
use crate::error::PerfError;
use crate::metrics::MetricsPublisher;
use crate::parser::{OutputParser, ParseEvent, ParseIssue};
use crate::results::{ResultAggregator, WorkerIdentity};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Launched, no parsed output yet.
    Starting,
    /// Produced at least one meaningful event.
    Running,
    /// Exit observed or launch failed; eligible for respawn.
    Dead,
    /// Failed too often in a row; no further launches.
    Quarantined,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Starting => write!(f, "starting"),
            SlotState::Running => write!(f, "running"),
            SlotState::Dead => write!(f, "dead"),
            SlotState::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Where reader tasks deliver parsed events.
#[derive(Clone)]
pub struct ResultSink {
    aggregator: Arc<ResultAggregator>,
    metrics: Option<Arc<MetricsPublisher>>,
}

impl ResultSink {
    pub fn new(aggregator: Arc<ResultAggregator>) -> Self {
        Self {
            aggregator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsPublisher>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsPublisher>> {
        self.metrics.as_ref()
    }

    fn record(&self, who: &WorkerIdentity, event: &ParseEvent) {
        self.aggregator.apply(who, event);
        if let Some(metrics) = &self.metrics {
            metrics.observe(who.port, event);
        }
    }
}

/// Human-readable exit description (`exit code 1`, `signal 9`).
pub fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(sig)) => format!("signal {}", sig),
        _ => status.to_string(),
    }
}

fn pin_to_core(cmd: &mut Command, core: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};

    // Runs in the forked child before exec; only async-signal-safe calls.
    unsafe {
        cmd.pre_exec(move || {
            let mut set = CpuSet::new();
            set.set(core)?;
            sched_setaffinity(Pid::from_raw(0), &set)?;
            Ok(())
        });
    }
}

/// A launched worker process.
pub struct WorkerProcess {
    identity: WorkerIdentity,
    child: Child,
    state: Arc<Mutex<SlotState>>,
    reader: Option<JoinHandle<u64>>,
    exit: Option<ExitStatus>,
}

impl WorkerProcess {
    /// Start `template` for `identity.port`, pinned to `identity.core` when
    /// `pin` is set. Must be called from within a Tokio runtime.
    pub fn spawn(
        template: &CommandTemplate,
        identity: WorkerIdentity,
        pin: bool,
        sink: &ResultSink,
    ) -> Result<Self, PerfError> {
        let launch_error = |source: std::io::Error| PerfError::Launch {
            binary: identity.binary.clone(),
            port: identity.port,
            source,
        };

        let (pipe_reader, pipe_writer) = os_pipe::pipe().map_err(launch_error)?;
        let stderr_writer = pipe_writer.try_clone().map_err(launch_error)?;

        let mut cmd = Command::new(template.program());
        cmd.args(template.args_for_port(identity.port))
            .stdin(Stdio::null())
            .stdout(pipe_writer)
            .stderr(stderr_writer)
            .process_group(0);
        if pin {
            pin_to_core(&mut cmd, identity.core);
        }

        debug!(core = identity.core, pinned = pin, "Launching: {}", template.render(identity.port));
        let child = cmd.spawn().map_err(launch_error)?;
        // The command still owns the parent's write ends; EOF needs them closed.
        drop(cmd);

        let state = Arc::new(Mutex::new(SlotState::Starting));
        let reader = {
            let identity = identity.clone();
            let state = state.clone();
            let sink = sink.clone();
            let mode = template.mode;
            tokio::task::spawn_blocking(move || {
                read_output(pipe_reader, &identity, OutputParser::new(mode), &sink, &state)
            })
        };

        info!(
            "Started {} on port {} (core {}, pid {})",
            identity.binary,
            identity.port,
            identity.core,
            child.id()
        );

        Ok(Self {
            identity,
            child,
            state,
            reader: Some(reader),
            exit: None,
        })
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn state(&self) -> SlotState {
        *self.state.lock()
    }

    /// Whether the reader has seen meaningful output.
    pub fn reached_running(&self) -> bool {
        self.state() == SlotState::Running
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Non-blocking exit check; the status is cached once observed.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Send `signal` to the worker's process group. Returns false when the
    /// group no longer exists.
    pub fn signal_group(&self, signal: Signal) -> bool {
        match killpg(self.pgid(), signal) {
            Ok(()) => true,
            Err(nix::errno::Errno::ESRCH) => false,
            Err(e) => {
                warn!("Failed to send {:?} to port {} group: {}", signal, self.identity.port, e);
                false
            }
        }
    }

    /// Whether any process is left in the worker's group. Children that
    /// outlived the leader keep the group alive after the leader is reaped.
    pub fn group_exists(&self) -> bool {
        killpg(self.pgid(), None).is_ok()
    }

    /// Leader reaped and nothing else left in its group.
    pub fn is_gone(&mut self) -> bool {
        let leader_done = match self.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                warn!("wait failed for port {}: {}", self.identity.port, e);
                true
            }
        };
        leader_done && !self.group_exists()
    }

    /// Whether the output reader has reached EOF (or was already joined).
    pub fn is_drained(&self) -> bool {
        self.reader.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait up to `timeout` for the reader to hit EOF. Returns the number of
    /// lines read, or `None` if the reader is still blocked.
    pub async fn join_reader(&mut self, timeout: Duration) -> Option<u64> {
        let handle = self.reader.as_mut()?;
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(lines)) => {
                self.reader = None;
                Some(lines)
            }
            Ok(Err(e)) => {
                warn!("Output reader for port {} failed: {}", self.identity.port, e);
                self.reader = None;
                None
            }
            Err(_) => None,
        }
    }
}

fn read_output(
    pipe: os_pipe::PipeReader,
    identity: &WorkerIdentity,
    mut parser: OutputParser,
    sink: &ResultSink,
    state: &Mutex<SlotState>,
) -> u64 {
    let port = identity.port;
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0u64;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(port, "Output read failed: {}", e);
                break;
            }
        }
        lines += 1;

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end();
        trace!(port, "{}", line);

        let event = parser.feed(line);
        match &event {
            ParseEvent::Unparseable(ParseIssue::Malformed { field }) => {
                warn!(port, "Malformed {} in line: {}", field, line);
            }
            ParseEvent::Unparseable(issue) => {
                debug!(port, ?issue, "Unparsed line: {}", line);
            }
            _ => {}
        }

        if event.is_progress() {
            let mut current = state.lock();
            if *current == SlotState::Starting {
                *current = SlotState::Running;
                drop(current);
                info!("Worker on port {} is running", port);
            }
        }

        sink.record(identity, &event);
    }

    debug!(port, lines, "Output stream closed");
    lines
}

/// SIGTERM every worker group that still has members, including groups whose
/// leader already exited, wait up to `grace`, then SIGKILL what is left and
/// reap the leaders. Returns how many groups had to be killed.
pub async fn terminate_all(workers: &mut [WorkerProcess], grace: Duration) -> usize {
    let mut pending: Vec<usize> = Vec::new();
    for (i, w) in workers.iter_mut().enumerate() {
        // Reap first so an exited leader is not signalled as a zombie.
        if !w.is_gone() && w.signal_group(Signal::SIGTERM) {
            pending.push(i);
        }
    }
    if pending.is_empty() {
        return 0;
    }
    debug!("Sent SIGTERM to {} worker groups", pending.len());

    wait_for_exit(workers, &mut pending, grace).await;
    let killed = pending.len();
    if killed == 0 {
        return 0;
    }

    for &i in &pending {
        warn!(
            "Worker group on port {} ignored SIGTERM; killing",
            workers[i].identity.port
        );
        workers[i].signal_group(Signal::SIGKILL);
    }
    wait_for_exit(workers, &mut pending, KILL_REAP_TIMEOUT).await;
    for &i in &pending {
        warn!(
            "Worker group {} on port {} did not go away",
            workers[i].pid(),
            workers[i].identity.port
        );
    }
    killed
}

async fn wait_for_exit(workers: &mut [WorkerProcess], pending: &mut Vec<usize>, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        pending.retain(|&i| !workers[i].is_gone());
        if pending.is_empty() || Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Join every reader against one shared deadline. Returns how many were
/// still blocked when it passed.
pub async fn join_readers(workers: &mut [WorkerProcess], timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut stuck = 0;
    for w in workers.iter_mut() {
        if w.reader.is_none() {
            continue;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if w.join_reader(remaining).await.is_none() && w.reader.is_some() {
            warn!("Output reader for port {} did not finish", w.identity.port);
            stuck += 1;
        }
    }
    stuck
}
