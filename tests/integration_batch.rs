//! One-shot runs against fake perftest binaries.

mod common;

use common::{fake_binary, template, SEPARATOR};
use rdma_perf::config::BatchConfig;
use rdma_perf::orchestrator::BatchEnd;
use rdma_perf::results::ResultStatus;
use rdma_perf::{
    BatchOrchestrator, CorePlan, ResultAggregator, ResultLogger, ResultSink, Role, TestMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn batch(dir: &std::path::Path, mode: TestMode, server_ip: Option<&str>, ports: Vec<u16>) -> BatchConfig {
    BatchConfig {
        template: template(dir, mode, server_ip),
        ports,
        launch_stagger: Duration::from_millis(10),
        watchdog: Some(Duration::from_secs(20)),
        shutdown_grace: Duration::from_millis(500),
        reader_join_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn one_shot_server_with_crashing_worker() {
    let bin = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    fake_binary(
        bin.path(),
        "ib_write_bw",
        &format!(
            r#"if [ "$port" = "18517" ]; then exit 1; fi
echo "{sep}"
echo " #bytes     #iterations    BW peak[Gb/sec]    BW average[Gb/sec]   MsgRate[Mpps]"
echo " 65536      5000             97.80              97.52               0.186001"
echo "{sep}""#,
            sep = SEPARATOR
        ),
    );

    let aggregator = Arc::new(ResultAggregator::new());
    let orchestrator = BatchOrchestrator::new(
        batch(bin.path(), TestMode::Bandwidth, None, vec![18515, 18516, 18517]),
        CorePlan::new(&[], 3),
        Role::Server,
        ResultSink::new(aggregator.clone()),
    );
    let (_tx, rx) = watch::channel(false);
    let report = orchestrator.run(rx).await;

    assert_eq!(report.end, BatchEnd::Completed);
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.status() == ResultStatus::Success));
    assert!(aggregator.get(18517).is_none());

    let crashed = report.outcomes.iter().find(|o| o.port == 18517).unwrap();
    assert_eq!(crashed.exit.as_deref(), Some("exit code 1"));
    assert!(!crashed.reached_running);

    for r in &report.results {
        let bw = r.bandwidth().unwrap();
        assert_eq!(bw.bytes, 65536);
        assert_eq!(bw.iterations, 5000);
        assert_eq!(bw.bw_avg_gbps, 97.52);
        assert_eq!(bw.msg_rate_mpps, 0.186001);
    }

    let logger = ResultLogger::new(logs.path(), true, false);
    let files = logger
        .write(Role::Server, "18515_3", TestMode::Bandwidth, &report.results)
        .unwrap();
    let mut rdr = csv::Reader::from_path(&files[0]).unwrap();
    let ports: Vec<String> = rdr.records().map(|r| r.unwrap()[1].to_string()).collect();
    assert_eq!(ports, vec!["18515", "18516"]);
}

#[tokio::test]
async fn client_latency_summary_skips_silent_threads() {
    let bin = tempfile::tempdir().unwrap();
    fake_binary(
        bin.path(),
        "ib_write_lat",
        &format!(
            r#"case "$port" in
  22500) avg=1.50 ;;
  22501) avg=2.50 ;;
  *) exit 0 ;;
esac
echo " #bytes #iterations    t_min[usec]    t_max[usec]  t_typical[usec]    t_avg[usec]    t_stdev[usec]   99% percentile[usec]   99.9% percentile[usec]"
echo "{sep}"
echo " 2       1000          1.00           5.00         1.40             $avg           0.10             2.00                    4.00"
echo "{sep}""#,
            sep = SEPARATOR
        ),
    );

    let orchestrator = BatchOrchestrator::new(
        batch(bin.path(), TestMode::Latency, Some("127.0.0.1"), vec![22500, 22501, 22502]),
        CorePlan::new(&[], 3),
        Role::Client,
        ResultSink::new(Arc::new(ResultAggregator::new())),
    );
    let (_tx, rx) = watch::channel(false);
    let report = orchestrator.run(rx).await;

    assert_eq!(report.end, BatchEnd::Completed);
    assert_eq!(report.results.len(), 2);
    let summary = report.latency_summary.unwrap();
    assert_eq!(summary.threads, 2);
    assert!((summary.mean_avg_usec - 2.0).abs() < 1e-9);
    assert_eq!((summary.best_thread, summary.best_avg_usec), (0, 1.5));
    assert_eq!((summary.worst_thread, summary.worst_avg_usec), (1, 2.5));
}
