#![allow(dead_code)]

use rdma_perf::{CommandTemplate, TestMode, TestType};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

/// Shell prologue that leaves the worker's `--port` value in `$port`.
pub const PORT_PROLOGUE: &str = r#"port=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--port" ]; then port="$2"; fi
  shift
done"#;

pub const SEPARATOR: &str =
    "---------------------------------------------------------------------------------------";

/// Install an executable `#!/bin/sh` script named `name` in `dir`.
pub fn fake_binary(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n{}\n", PORT_PROLOGUE, body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn template(dir: &Path, mode: TestMode, server_ip: Option<&str>) -> CommandTemplate {
    CommandTemplate {
        device: "mlx5_0".to_string(),
        test_type: TestType::Write,
        mode,
        ib_port: 1,
        size: 65536,
        qdepth: 512,
        duration: Some(Duration::from_secs(5)),
        server_ip: server_ip.map(str::to_string),
        report_gbits: true,
        report_per_second: false,
        binary_dir: Some(dir.to_path_buf()),
    }
}

/// Poll `cond` every 20ms for up to `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
