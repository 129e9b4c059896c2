//! Shared daemon scaffolding.
//!
//! Every pipeline stage is a long-lived process looping over "do one
//! pass, sleep if nothing was found". Cancellation is explicit: a
//! `CancellationToken` raised by SIGTERM/SIGINT, plus the `stop_daemons`
//! trigger file checked at each pass boundary. A pass either completes
//! or the whole process exits; there are no half-applied passes to
//! resume.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// Options common to all daemons.
#[derive(Debug, Clone)]
pub struct DaemonOpts {
    /// Run a single pass and exit (testing / cron use).
    pub one_pass: bool,
    /// Sleep between passes that found no work.
    pub sleep_interval: Duration,
}

impl Default for DaemonOpts {
    fn default() -> Self {
        Self {
            one_pass: false,
            sleep_interval: Duration::from_secs(5),
        }
    }
}

/// One pipeline stage, driven by `run_daemon`.
#[async_trait]
pub trait DaemonPass: Send {
    fn name(&self) -> &'static str;

    /// Perform one bounded pass. Returns true if any work was done
    /// (the loop then re-polls immediately instead of sleeping).
    async fn pass(&mut self) -> Result<bool>;
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. Daemons poll this token between items and drain gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

/// Drive a daemon until shutdown, stop trigger, or (in one-pass mode)
/// the first completed pass.
pub async fn run_daemon(
    daemon: &mut dyn DaemonPass,
    opts: &DaemonOpts,
    stop_trigger: &Path,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!(daemon = daemon.name(), one_pass = opts.one_pass, "Daemon starting");
    loop {
        if shutdown.is_cancelled() {
            info!(daemon = daemon.name(), "Shutdown requested, exiting");
            break;
        }
        if stop_trigger.exists() {
            info!(
                daemon = daemon.name(),
                trigger = %stop_trigger.display(),
                "Stop trigger present, exiting"
            );
            break;
        }

        let did_work = daemon.pass().await?;

        if opts.one_pass {
            break;
        }
        if !did_work {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(opts.sleep_interval) => {}
            }
        }
    }
    Ok(())
}

/// Consume a trigger file if present: returns true and deletes it.
/// Used by the feeder's `reread_db` live-rescan hook.
pub fn consume_trigger(path: &PathBuf) -> bool {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(trigger = %path.display(), error = %e, "Failed to remove trigger file");
        }
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDaemon {
        passes: u32,
        work_for: u32,
    }

    #[async_trait]
    impl DaemonPass for CountingDaemon {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn pass(&mut self) -> Result<bool> {
            self.passes += 1;
            Ok(self.passes <= self.work_for)
        }
    }

    #[tokio::test]
    async fn one_pass_runs_exactly_once() {
        let mut d = CountingDaemon {
            passes: 0,
            work_for: 10,
        };
        let opts = DaemonOpts {
            one_pass: true,
            ..Default::default()
        };
        let token = CancellationToken::new();
        run_daemon(&mut d, &opts, Path::new("/nonexistent/stop"), &token)
            .await
            .unwrap();
        assert_eq!(d.passes, 1);
    }

    #[tokio::test]
    async fn stop_trigger_halts_loop() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = dir.path().join("stop_daemons");
        std::fs::write(&trigger, "").unwrap();

        let mut d = CountingDaemon {
            passes: 0,
            work_for: 10,
        };
        let opts = DaemonOpts::default();
        let token = CancellationToken::new();
        run_daemon(&mut d, &opts, &trigger, &token).await.unwrap();
        assert_eq!(d.passes, 0);
    }

    #[tokio::test]
    async fn cancelled_token_halts_before_pass() {
        let mut d = CountingDaemon {
            passes: 0,
            work_for: 10,
        };
        let token = CancellationToken::new();
        token.cancel();
        run_daemon(
            &mut d,
            &DaemonOpts::default(),
            Path::new("/nonexistent/stop"),
            &token,
        )
        .await
        .unwrap();
        assert_eq!(d.passes, 0);
    }

    #[test]
    fn consume_trigger_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reread_db");
        std::fs::write(&path, "").unwrap();
        assert!(consume_trigger(&path));
        assert!(!path.exists());
        assert!(!consume_trigger(&path));
    }
}
