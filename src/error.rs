//! Error taxonomy for the supervision engine.
//!
//! Only device resolution and configuration errors are fatal at startup.
//! Everything else is scoped to a single slot or a single output line and is
//! logged by the caller, which keeps running in a degraded state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerfError {
    /// No local TCP port at or above `start` could be bound.
    #[error("no free TCP port available at or above {start}")]
    NoFreePort { start: u16 },

    /// The RDMA device could not be resolved. Fatal for the supervisor.
    #[error("RDMA device unavailable: {0}")]
    DeviceUnavailable(String),

    /// CPU topology could not be read. Callers degrade to a synthetic core list.
    #[error("CPU topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// The benchmark binary could not be started for a slot.
    #[error("failed to launch {binary} on port {port}: {source}")]
    Launch {
        binary: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Invalid role/server-ip/port configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for PerfError {
    fn from(err: prometheus::Error) -> Self {
        PerfError::Metrics(err.to_string())
    }
}

impl PerfError {
    /// Whether the error should abort the whole process rather than a single slot.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PerfError::DeviceUnavailable(_) | PerfError::InvalidConfig(_)
        )
    }
}

/// Process exit status for an error that ended the run: 2 when a fatal
/// [`PerfError`] is anywhere in the chain, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let fatal = err
        .chain()
        .filter_map(|e| e.downcast_ref::<PerfError>())
        .any(PerfError::is_fatal);
    if fatal {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(PerfError::DeviceUnavailable("mlx5_0".into()).is_fatal());
        assert!(PerfError::InvalidConfig("client needs --server-ip".into()).is_fatal());
        assert!(!PerfError::NoFreePort { start: 18515 }.is_fatal());
        assert!(!PerfError::TopologyUnavailable("no cpulist".into()).is_fatal());
    }

    #[test]
    fn test_exit_code() {
        use anyhow::Context;

        let fatal = anyhow::Error::from(PerfError::InvalidConfig("bad".into()));
        assert_eq!(exit_code(&fatal), 2);

        let wrapped = Err::<(), _>(PerfError::DeviceUnavailable("mlx5_9".into()))
            .context("startup")
            .unwrap_err();
        assert_eq!(exit_code(&wrapped), 2);

        let io = anyhow::Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            .context("Failed to write result logs");
        assert_eq!(exit_code(&io), 1);
        assert_eq!(exit_code(&anyhow::Error::from(PerfError::NoFreePort { start: 1 })), 1);
    }

    #[test]
    fn test_launch_error_display() {
        let err = PerfError::Launch {
            binary: "ib_write_bw".into(),
            port: 18515,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.contains("ib_write_bw"));
        assert!(msg.contains("18515"));
    }
}
