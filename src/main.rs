//! # RDMA Perf Supervisor - Main Entry Point
//!
//! 1. **Parse arguments** and initialize logging
//! 2. **Validate configuration** and resolve the RDMA device; failures here
//!    are fatal and exit with status 2
//! 3. **Run** a one-shot batch or, for `--persistent` servers, a supervised
//!    pool until SIGINT/SIGTERM
//! 4. **Flush results** to CSV/JSON when requested
//!
//! Everything after startup degrades instead of failing: launch errors,
//! crashed workers and unparseable output are logged and the run continues.

use anyhow::{Context, Result};
use clap::Parser;
use rdma_perf::{
    cli::{Args, TestMode},
    error::exit_code,
    logging::init_logging,
    metrics::spawn_endpoint,
    topology::DEFAULT_SYSFS_ROOT,
    BatchOrchestrator, DeviceContext, MetricsPublisher, ResultAggregator, ResultSink, RunConfig,
    WorkerSupervisor,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match init_logging(args.verbose, args.quiet, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code == 2 {
                error!("Fatal: {:#}", e);
            } else {
                error!("Run failed: {:#}", e);
            }
            ExitCode::from(code)
        }
    }
}

/// Flip the shutdown channel on SIGINT or SIGTERM.
fn install_signal_handlers(tx: watch::Sender<bool>) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Interrupt received; shutting down");
            }
            _ = term.recv() => info!("SIGTERM received; shutting down"),
        }
        let _ = tx.send(true);
    });
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!("Starting RDMA perf supervisor v{}", rdma_perf::VERSION);

    let config = RunConfig::from_args(&args)?;
    let device = DeviceContext::resolve(config.device.as_deref(), Path::new(DEFAULT_SYSFS_ROOT))?;
    info!(
        "Device {} (interface {}, NUMA {}), {} local cores",
        device.device_name,
        device.interface_name.as_deref().unwrap_or("-"),
        device
            .numa_node
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".into()),
        device.cpu_cores.len()
    );
    let plan = config.core_plan(&device);
    info!(
        "Role {}, {} {} x{} on ports from {}",
        config.role,
        config.test_type,
        config.mode,
        config.threads,
        config.worker_ports().first().copied().unwrap_or(config.base_port)
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    install_signal_handlers(shutdown_tx)?;

    let aggregator = Arc::new(ResultAggregator::new());
    let mut sink = ResultSink::new(aggregator.clone());
    let mut endpoint = None;
    if config.enable_prometheus {
        let publisher = Arc::new(MetricsPublisher::new()?);
        endpoint = spawn_endpoint(publisher.clone(), config.prometheus_port, shutdown_rx.clone());
        sink = sink.with_metrics(publisher);
    }

    if config.persistent {
        let mut sup_config = config.supervisor_config(&device);
        sup_config.template.probe_report_per_second();
        let supervisor = Arc::new(WorkerSupervisor::new(sup_config, plan, sink));

        let started = supervisor.schedule(config.threads);
        info!("Persistent mode: {} of {} workers started", started, config.threads);
        supervisor.start_background();

        let mut rx = shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        let report = supervisor.shutdown().await;
        info!(
            "Stopped {} workers ({} killed after grace period)",
            report.terminated, report.killed
        );
    } else {
        let mut batch = config.batch_config(&device);
        batch.template.probe_report_per_second();
        let orchestrator = BatchOrchestrator::new(batch, plan, config.role, sink);

        let report = orchestrator.run(shutdown_rx.clone()).await;
        info!(
            "Batch {:?}: {} of {} workers produced results",
            report.end,
            report.successful(),
            report.outcomes.len()
        );
        if config.mode == TestMode::Latency {
            match &report.latency_summary {
                Some(summary) => println!("{}", summary),
                None => warn!("No latency results collected"),
            }
        }
    }

    let logger = config.logger();
    if logger.enabled() {
        let results = aggregator.snapshot();
        logger
            .write(config.role, &config.run_id(), config.mode, &results)
            .context("Failed to write result logs")?;
    }

    if let Some(handle) = endpoint {
        handle.abort();
    }
    Ok(())
}
