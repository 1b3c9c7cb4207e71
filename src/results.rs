use crate::cli::{Role, TestMode};
use crate::parser::{ConnectionInfo, ParseEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Connection records kept per thread; older ones are dropped first.
pub const MAX_CONNECTIONS_PER_THREAD: usize = 16;

/// One row of a bandwidth table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub bytes: u64,
    pub iterations: u64,
    pub bw_avg_gbps: f64,
    pub msg_rate_mpps: f64,
}

/// One row of a latency table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub payload_size: u64,
    pub iterations: u64,
    pub t_min_usec: f64,
    pub t_max_usec: f64,
    pub t_typical_usec: f64,
    pub t_avg_usec: f64,
    pub t_stdev_usec: f64,
    pub t_99_usec: f64,
    pub t_999_usec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    Bandwidth(BandwidthSample),
    Latency(LatencySample),
}

/// Who produced a stream of events. `thread_id` is the aggregator key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub thread_id: u32,
    pub port: u16,
    pub core: usize,
    pub binary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    NoResult,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::NoResult => write!(f, "no_result"),
        }
    }
}

/// Latest known state of one worker thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadResult {
    pub thread_id: u32,
    pub port: u16,
    pub core: usize,
    pub binary: String,
    pub gid: Option<String>,
    pub connections: Vec<ConnectionInfo>,
    pub sample: Option<Sample>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadResult {
    fn new(who: &WorkerIdentity) -> Self {
        Self {
            thread_id: who.thread_id,
            port: who.port,
            core: who.core,
            binary: who.binary.clone(),
            gid: None,
            connections: Vec::new(),
            sample: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ResultStatus {
        if self.sample.is_some() {
            ResultStatus::Success
        } else {
            ResultStatus::NoResult
        }
    }

    pub fn bandwidth(&self) -> Option<&BandwidthSample> {
        match &self.sample {
            Some(Sample::Bandwidth(s)) => Some(s),
            _ => None,
        }
    }

    pub fn latency(&self) -> Option<&LatencySample> {
        match &self.sample {
            Some(Sample::Latency(s)) => Some(s),
            _ => None,
        }
    }
}

/// Shared per-run result map.
///
/// Each key has a single writer (the reader task of that worker) while the
/// logger and the metrics path read whole snapshots, so one lock around the
/// map is enough. Writes are last-write-wins per key.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    inner: RwLock<HashMap<u32, ThreadResult>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a parse event into the worker's entry. Returns whether anything
    /// was stored; events with no payload leave the map untouched so a
    /// worker that never reports stays absent.
    pub fn apply(&self, who: &WorkerIdentity, event: &ParseEvent) -> bool {
        match event {
            ParseEvent::Connection(conn) => {
                self.update(who, |entry| {
                    entry.connections.push(conn.clone());
                    let excess = entry
                        .connections
                        .len()
                        .saturating_sub(MAX_CONNECTIONS_PER_THREAD);
                    entry.connections.drain(..excess);
                });
                true
            }
            ParseEvent::Gid(gid) => {
                self.update(who, |entry| entry.gid = Some(gid.clone()));
                true
            }
            ParseEvent::Bandwidth(sample) => {
                self.record_sample(who, Sample::Bandwidth(*sample));
                true
            }
            ParseEvent::Latency(sample) => {
                self.record_sample(who, Sample::Latency(*sample));
                true
            }
            ParseEvent::Ignore | ParseEvent::HeaderBoundary | ParseEvent::Unparseable(_) => false,
        }
    }

    /// Replace the worker's sample with the newest one.
    pub fn record_sample(&self, who: &WorkerIdentity, sample: Sample) {
        self.update(who, |entry| entry.sample = Some(sample));
    }

    fn update(&self, who: &WorkerIdentity, f: impl FnOnce(&mut ThreadResult)) {
        let mut map = self.inner.write();
        let entry = map
            .entry(who.thread_id)
            .or_insert_with(|| ThreadResult::new(who));
        f(entry);
        entry.updated_at = Utc::now();
    }

    pub fn get(&self, thread_id: u32) -> Option<ThreadResult> {
        self.inner.read().get(&thread_id).cloned()
    }

    /// Copy of every entry, ordered by thread id.
    pub fn snapshot(&self) -> Vec<ThreadResult> {
        let mut rows: Vec<ThreadResult> = self.inner.read().values().cloned().collect();
        rows.sort_by_key(|r| r.thread_id);
        rows
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Number of entries holding a measurement.
    pub fn sample_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|r| r.sample.is_some())
            .count()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn latency_summary(&self) -> Option<LatencySummary> {
        LatencySummary::from_results(&self.snapshot())
    }
}

/// Average/best/worst of `t_avg_usec` over threads that produced a latency
/// sample. Threads without one are excluded, not counted as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub threads: usize,
    pub mean_avg_usec: f64,
    pub best_thread: u32,
    pub best_avg_usec: f64,
    pub worst_thread: u32,
    pub worst_avg_usec: f64,
}

impl LatencySummary {
    pub fn from_results(results: &[ThreadResult]) -> Option<Self> {
        let values: Vec<(u32, f64)> = results
            .iter()
            .filter_map(|r| r.latency().map(|l| (r.thread_id, l.t_avg_usec)))
            .collect();
        let (&first, rest) = values.split_first()?;

        let (mut best, mut worst, mut total) = (first, first, first.1);
        for &(tid, v) in rest {
            total += v;
            if v < best.1 {
                best = (tid, v);
            }
            if v > worst.1 {
                worst = (tid, v);
            }
        }

        Some(Self {
            threads: values.len(),
            mean_avg_usec: total / values.len() as f64,
            best_thread: best.0,
            best_avg_usec: best.1,
            worst_thread: worst.0,
            worst_avg_usec: worst.1,
        })
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Latency summary ({} threads):", self.threads)?;
        writeln!(f, "  Avg across all threads: {:.2} usec", self.mean_avg_usec)?;
        writeln!(
            f,
            "  Best thread {}:  {:.2} usec",
            self.best_thread, self.best_avg_usec
        )?;
        write!(
            f,
            "  Worst thread {}: {:.2} usec",
            self.worst_thread, self.worst_avg_usec
        )
    }
}

/// Persisted form of one thread. Absent measurements are omitted, never
/// written as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub thread_id: u32,
    pub port: u16,
    pub core: usize,
    pub binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionInfo>,
    pub status: ResultStatus,
}

impl LogRecord {
    pub fn from_result(result: &ThreadResult, mode: TestMode) -> Self {
        let (bandwidth, latency, connections) = match mode {
            TestMode::Bandwidth => (
                result.bandwidth().copied(),
                None,
                result.connections.clone(),
            ),
            TestMode::Latency => (None, result.latency().copied(), Vec::new()),
        };
        let status = if bandwidth.is_some() || latency.is_some() {
            ResultStatus::Success
        } else {
            ResultStatus::NoResult
        };
        Self {
            thread_id: result.thread_id,
            port: result.port,
            core: result.core,
            binary: result.binary.clone(),
            gid: result.gid.clone(),
            bandwidth,
            latency,
            connections,
            status,
        }
    }
}

const BANDWIDTH_COLUMNS: &[&str] = &[
    "thread_id",
    "port",
    "core",
    "binary",
    "gid",
    "bytes",
    "iterations",
    "bw_avg_gbps",
    "msg_rate_mpps",
    "connections",
    "status",
];

const LATENCY_COLUMNS: &[&str] = &[
    "thread_id",
    "port",
    "core",
    "binary",
    "gid",
    "payload_size",
    "iterations",
    "t_min_usec",
    "t_max_usec",
    "t_typical_usec",
    "t_avg_usec",
    "t_stdev_usec",
    "t_99_percentile_usec",
    "t_999_percentile_usec",
    "status",
];

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes result snapshots as CSV and/or JSON under a logs directory.
#[derive(Debug, Clone)]
pub struct ResultLogger {
    dir: PathBuf,
    csv: bool,
    json: bool,
}

impl ResultLogger {
    pub fn new(dir: impl Into<PathBuf>, csv: bool, json: bool) -> Self {
        Self {
            dir: dir.into(),
            csv,
            json,
        }
    }

    pub fn enabled(&self) -> bool {
        self.csv || self.json
    }

    /// `{role}_{run_id}_{YYYYmmdd_HHMMSS}` inside the logs directory.
    pub fn file_stem(&self, role: Role, run_id: &str) -> PathBuf {
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.dir.join(format!("{}_{}_{}", role, run_id, ts))
    }

    /// Persist `results`; returns the files written (none when disabled).
    pub fn write(
        &self,
        role: Role,
        run_id: &str,
        mode: TestMode,
        results: &[ThreadResult],
    ) -> Result<Vec<PathBuf>> {
        if !self.enabled() {
            debug!("result logging disabled");
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create logs directory {}", self.dir.display()))?;

        let records: Vec<LogRecord> = results
            .iter()
            .map(|r| LogRecord::from_result(r, mode))
            .collect();
        let stem = self.file_stem(role, run_id);
        let mut written = Vec::new();

        if self.csv {
            let path = stem.with_extension("csv");
            write_csv(&path, mode, &records)?;
            written.push(path);
        }
        if self.json {
            let path = stem.with_extension("json");
            write_json(&path, &records)?;
            written.push(path);
        }

        for path in &written {
            info!("Results written to: {}", path.display());
        }
        Ok(written)
    }
}

fn write_csv(path: &Path, mode: TestMode, records: &[LogRecord]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut wtr = csv::Writer::from_writer(file);

    match mode {
        TestMode::Bandwidth => {
            wtr.write_record(BANDWIDTH_COLUMNS)?;
            for r in records {
                let bw = r.bandwidth.as_ref();
                let connections = if r.connections.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&r.connections)?
                };
                wtr.write_record([
                    r.thread_id.to_string(),
                    r.port.to_string(),
                    r.core.to_string(),
                    r.binary.clone(),
                    r.gid.clone().unwrap_or_default(),
                    cell(bw.map(|s| s.bytes)),
                    cell(bw.map(|s| s.iterations)),
                    cell(bw.map(|s| s.bw_avg_gbps)),
                    cell(bw.map(|s| s.msg_rate_mpps)),
                    connections,
                    r.status.to_string(),
                ])?;
            }
        }
        TestMode::Latency => {
            wtr.write_record(LATENCY_COLUMNS)?;
            for r in records {
                let lat = r.latency.as_ref();
                wtr.write_record([
                    r.thread_id.to_string(),
                    r.port.to_string(),
                    r.core.to_string(),
                    r.binary.clone(),
                    r.gid.clone().unwrap_or_default(),
                    cell(lat.map(|s| s.payload_size)),
                    cell(lat.map(|s| s.iterations)),
                    cell(lat.map(|s| s.t_min_usec)),
                    cell(lat.map(|s| s.t_max_usec)),
                    cell(lat.map(|s| s.t_typical_usec)),
                    cell(lat.map(|s| s.t_avg_usec)),
                    cell(lat.map(|s| s.t_stdev_usec)),
                    cell(lat.map(|s| s.t_99_usec)),
                    cell(lat.map(|s| s.t_999_usec)),
                    r.status.to_string(),
                ])?;
            }
        }
    }

    wtr.flush()?;
    Ok(())
}

fn write_json(path: &Path, records: &[LogRecord]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
