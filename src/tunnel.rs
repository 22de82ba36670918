use anyhow::{Context, Result};
use regex::Regex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Current tunnel state, written only by the supervisor task and distributed
/// to the health endpoint and the publisher over a watch channel.
#[derive(Debug, Clone, Default)]
pub struct TunnelStatus {
    pub url: Option<String>,
    pub healthy: bool,
    pub last_error: Option<String>,
}

impl TunnelStatus {
    fn running(url: String) -> Self {
        Self {
            url: Some(url),
            healthy: true,
            last_error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            url: None,
            healthy: false,
            last_error: Some(error),
        }
    }
}

pub fn status_channel() -> (watch::Sender<TunnelStatus>, watch::Receiver<TunnelStatus>) {
    watch::channel(TunnelStatus::default())
}

enum AttemptOutcome {
    /// Child exited or never produced a URL; restart after backoff.
    Failed(String),
    /// Shutdown requested; stop supervising.
    Cancelled,
}

/// Supervises the external tunnel subprocess.
///
/// State machine: Starting -> Running(url) -> Failed -> (backoff) -> Starting,
/// terminal only on cancellation. Every transition into Running publishes the
/// URL on the watch channel; the publisher is responsible for ignoring a URL
/// identical to the last one it pushed.
pub struct TunnelSupervisor {
    config: Arc<Config>,
    status_tx: watch::Sender<TunnelStatus>,
    cancel: CancellationToken,
    url_pattern: Regex,
}

impl TunnelSupervisor {
    pub fn new(
        config: Arc<Config>,
        status_tx: watch::Sender<TunnelStatus>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let url_pattern = Regex::new(r"https://[A-Za-z0-9-]+\.trycloudflare\.com")
            .context("Invalid tunnel URL pattern")?;
        Ok(Self {
            config,
            status_tx,
            cancel,
            url_pattern,
        })
    }

    /// Run the supervision loop until cancelled.
    pub async fn run(self) {
        let initial = Duration::from_secs(self.config.tunnel.initial_backoff_secs.max(1));
        let max = Duration::from_secs(self.config.tunnel.max_backoff_secs.max(1));
        let mut backoff = initial;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.attempt(&mut backoff, initial).await {
                AttemptOutcome::Cancelled => break,
                AttemptOutcome::Failed(reason) => {
                    warn!("Tunnel failed: {reason}; retrying in {:?}", backoff);
                    self.status_tx.send_replace(TunnelStatus::failed(reason));

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(max);
                }
            }
        }

        info!("Tunnel supervisor stopped");
    }

    /// One Starting -> Running -> exit cycle. Resets `backoff` to `initial`
    /// once a URL has been obtained.
    async fn attempt(&self, backoff: &mut Duration, initial: Duration) -> AttemptOutcome {
        info!("Starting tunnel: {}", self.config.tunnel.command);

        let mut child = match self.spawn_tunnel() {
            Ok(child) => child,
            Err(e) => return AttemptOutcome::Failed(format!("failed to spawn tunnel: {e:#}")),
        };

        let (mut stdout, mut stderr) = match take_line_readers(&mut child) {
            Ok(readers) => readers,
            Err(e) => {
                self.terminate(&mut child).await;
                return AttemptOutcome::Failed(e.to_string());
            }
        };

        // Phase one: wait for the public URL to appear on either stream.
        let startup = Duration::from_secs(self.config.tunnel.startup_timeout_secs);
        let deadline = tokio::time::sleep(startup);
        tokio::pin!(deadline);

        let url = loop {
            tokio::select! {
                line = next_line(&mut stdout) => {
                    match self.match_url(line) {
                        LineOutcome::Url(url) => break url,
                        LineOutcome::Line => {}
                        LineOutcome::Eof => {}
                    }
                }
                line = next_line(&mut stderr) => {
                    match self.match_url(line) {
                        LineOutcome::Url(url) => break url,
                        LineOutcome::Line => {}
                        LineOutcome::Eof => {}
                    }
                }
                status = child.wait() => {
                    return AttemptOutcome::Failed(match status {
                        Ok(status) => format!("tunnel exited during startup: {status}"),
                        Err(e) => format!("failed to wait on tunnel: {e}"),
                    });
                }
                _ = &mut deadline => {
                    self.terminate(&mut child).await;
                    return AttemptOutcome::Failed(format!(
                        "no tunnel URL within {}s", startup.as_secs()
                    ));
                }
                _ = self.cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return AttemptOutcome::Cancelled;
                }
            }
        };

        info!("Tunnel active: {url}");
        *backoff = initial;
        self.status_tx.send_replace(TunnelStatus::running(url));

        // Phase two: keep draining output so the pipes never fill, and watch
        // for the child exiting.
        loop {
            tokio::select! {
                line = next_line(&mut stdout) => { self.match_url(line); }
                line = next_line(&mut stderr) => { self.match_url(line); }
                status = child.wait() => {
                    return AttemptOutcome::Failed(match status {
                        Ok(status) => format!("tunnel exited: {status}"),
                        Err(e) => format!("failed to wait on tunnel: {e}"),
                    });
                }
                _ = self.cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return AttemptOutcome::Cancelled;
                }
            }
        }
    }

    fn spawn_tunnel(&self) -> Result<Child> {
        let port = self.config.port.to_string();
        let args: Vec<String> = self
            .config
            .tunnel
            .args
            .iter()
            .map(|arg| arg.replace("{port}", &port))
            .collect();

        Command::new(&self.config.tunnel.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("'{}' could not be started", self.config.tunnel.command))
    }

    fn match_url(&self, line: Option<String>) -> LineOutcome {
        match line {
            Some(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!("[tunnel] {trimmed}");
                }
                match self.url_pattern.find(&line) {
                    Some(m) => LineOutcome::Url(m.as_str().to_string()),
                    None => LineOutcome::Line,
                }
            }
            None => LineOutcome::Eof,
        }
    }

    /// Graceful stop: ask the child to exit, then force-kill after a grace
    /// period.
    async fn terminate(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            debug!("Tunnel already gone: {e}");
            return;
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("Tunnel terminated: {status}"),
            Ok(Err(e)) => error!("Failed waiting for tunnel to exit: {e}"),
            Err(_) => {
                warn!("Tunnel did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill tunnel: {e}");
                }
            }
        }
    }
}

enum LineOutcome {
    Url(String),
    Line,
    Eof,
}

type LineReader<R> = Lines<BufReader<R>>;

fn take_line_readers(
    child: &mut Child,
) -> Result<(LineReader<ChildStdout>, LineReader<ChildStderr>)> {
    let stdout = child
        .stdout
        .take()
        .context("tunnel stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("tunnel stderr was not captured")?;
    Ok((
        BufReader::new(stdout).lines(),
        BufReader::new(stderr).lines(),
    ))
}

/// Next line from a stream; after EOF, pends forever so the surrounding
/// select keeps servicing the other arms.
async fn next_line<R: tokio::io::AsyncRead + Unpin>(lines: &mut LineReader<R>) -> Option<String> {
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        _ => {
            std::future::pending::<()>().await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::time::Instant;

    fn supervisor_with(
        command: &str,
        args: Vec<String>,
    ) -> (
        TunnelSupervisor,
        watch::Receiver<TunnelStatus>,
        CancellationToken,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.tunnel.command = command.to_string();
        config.tunnel.args = args;
        config.tunnel.startup_timeout_secs = 2;
        config.tunnel.initial_backoff_secs = 1;
        config.tunnel.max_backoff_secs = 4;
        // Keep the tempdir alive for the duration of the test by leaking it;
        // the config only records the path.
        std::mem::forget(dir);

        let (tx, rx) = status_channel();
        let cancel = CancellationToken::new();
        let supervisor = TunnelSupervisor::new(Arc::new(config), tx, cancel.clone()).unwrap();
        (supervisor, rx, cancel)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaches_running_when_url_is_printed() {
        let (supervisor, mut rx, cancel) = supervisor_with(
            "/bin/sh",
            vec![
                "-c".to_string(),
                "echo https://unit-test.trycloudflare.com; sleep 30".to_string(),
            ],
        );

        let handle = tokio::spawn(supervisor.run());

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                rx.changed().await.unwrap();
                let status = rx.borrow().clone();
                if status.healthy {
                    return status;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            status.url.as_deref(),
            Some("https://unit-test.trycloudflare.com")
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restarts_with_backoff_on_immediate_exit() {
        let (supervisor, mut rx, cancel) =
            supervisor_with("/bin/sh", vec!["-c".to_string(), "exit 1".to_string()]);

        let handle = tokio::spawn(supervisor.run());
        let started = Instant::now();

        // Two consecutive failures prove the Starting -> Failed -> Starting
        // cycle; the elapsed time proves a real backoff, not a busy loop.
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(10), rx.changed())
                .await
                .unwrap()
                .unwrap();
            let status = rx.borrow().clone();
            assert!(!status.healthy);
            assert!(status.last_error.is_some());
        }
        assert!(started.elapsed() >= Duration::from_secs(1));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn missing_binary_reports_failure() {
        let (supervisor, mut rx, cancel) =
            supervisor_with("/nonexistent/tunnel-binary", vec![]);

        let handle = tokio::spawn(supervisor.run());

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        let status = rx.borrow().clone();
        assert!(!status.healthy);
        assert!(status.last_error.unwrap().contains("could not be started"));

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
