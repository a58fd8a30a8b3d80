//! Waiting for a debugger before serving.
//!
//! With `--debug` the plugin is started by hand under a debugger, not by the
//! host. Serving only begins once [`DebuggerAttach::wait_for_attach`]
//! returns. The protocol itself is unchanged.

use std::time::Duration;

use crate::error::ServeError;

/// Something that blocks until a debugger is attached.
#[async_trait::async_trait]
pub trait DebuggerAttach: Send + Sync {
    /// Return once a debugger is attached to this process.
    async fn wait_for_attach(&self) -> Result<(), ServeError>;
}

/// Polls the kernel for a tracer on this process.
///
/// On Linux this reads `TracerPid` from `/proc/self/status`. Elsewhere
/// there is no portable check, so it logs a warning and returns at once.
#[derive(Debug, Clone)]
pub struct TracerPidProbe {
    poll_interval: Duration,
}

impl Default for TracerPidProbe {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl TracerPidProbe {
    /// Create a probe with a custom poll interval.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

/// Extract the tracer pid from the contents of `/proc/<pid>/status`.
pub fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

#[async_trait::async_trait]
impl DebuggerAttach for TracerPidProbe {
    #[cfg(target_os = "linux")]
    async fn wait_for_attach(&self) -> Result<(), ServeError> {
        tracing::info!(pid = std::process::id(), "Waiting for a debugger to attach");
        loop {
            let status = tokio::fs::read_to_string("/proc/self/status").await?;
            match parse_tracer_pid(&status) {
                Some(0) => tokio::time::sleep(self.poll_interval).await,
                Some(tracer) => {
                    tracing::info!(tracer, "Debugger attached");
                    return Ok(());
                }
                None => {
                    return Err(ServeError::Debugger(
                        "TracerPid missing from /proc/self/status".to_string(),
                    ))
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn wait_for_attach(&self) -> Result<(), ServeError> {
        let _ = self.poll_interval;
        tracing::warn!(
            pid = std::process::id(),
            "Debugger detection is not available on this platform, continuing"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tracer_pid() {
        let status = "Name:\tprovider\nState:\tS (sleeping)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(parse_tracer_pid(status), Some(4242));

        let status = "Name:\tprovider\nTracerPid:\t0\n";
        assert_eq!(parse_tracer_pid(status), Some(0));

        assert_eq!(parse_tracer_pid("Name:\tprovider\n"), None);
    }
}
