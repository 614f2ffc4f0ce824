//! Process shutdown signals: Ctrl+C everywhere, plus SIGTERM on unix.

use anyhow::{Context, Result};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Installed signal listeners. Install before launching the browser so a `kill` during startup
/// still reaches the shutdown path.
pub struct ShutdownSignal {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl ShutdownSignal {
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("installing SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        Ok(Self {})
    }

    /// Resolves with the name of the first signal received.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_is_reported_as_shutdown() {
        let mut shutdown = ShutdownSignal::install().unwrap();
        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("run kill");
        assert!(status.success());

        let received = tokio::time::timeout(Duration::from_secs(5), shutdown.recv())
            .await
            .expect("SIGTERM delivered");
        assert_eq!(received, "SIGTERM");
    }
}
