//! Job process execution
//!
//! Runs one job process to completion and streams its output line by line:
//! - Output lines go to an [`OutputSink`] as they arrive
//! - A run with no output for the idle timeout is stopped
//! - An optional hard timeout bounds the whole run
//! - Cancellation and timeouts stop the process gracefully: the shutdown
//!   file is written, the process gets its stopping wait, then it is killed

use async_trait::async_trait;
use kudu_core::domain::job::JobKind;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for output readers to drain after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives a job's output as it is produced
pub trait OutputSink: Send + Sync {
    fn stdout_line(&self, line: &str);

    fn stderr_line(&self, line: &str);
}

/// Everything needed to start one job process
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_name: String,
    pub kind: JobKind,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Written to ask the process to exit
    pub shutdown_file: PathBuf,
    /// Grace period between the shutdown request and a kill
    pub stopping_wait: Duration,
    pub idle_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own; `None` when killed by a signal
    Exited { code: Option<i32> },
    IdleTimeout,
    TimedOut,
    Cancelled,
}

/// Service trait for running job processes
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs the process described by `request` until it exits or is stopped
    ///
    /// Only failures to start or wait for the process are errors.
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: Arc<dyn OutputSink>,
    ) -> io::Result<ExitOutcome>;
}

/// Runs jobs as local child processes
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Ask the process to exit through the shutdown file, kill it after the
    /// stopping wait
    async fn stop(child: &mut Child, request: &ExecutionRequest) -> io::Result<()> {
        if let Some(parent) = request.shutdown_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&request.shutdown_file, b"").await {
            warn!(
                "Failed to write shutdown file for {}: {}",
                request.job_name, e
            );
        }

        match time::timeout(request.stopping_wait, child.wait()).await {
            Ok(status) => {
                debug!("Job {} stopped gracefully: {:?}", request.job_name, status);
            }
            Err(_) => {
                info!(
                    "Job {} did not stop within {:?}, killing",
                    request.job_name, request.stopping_wait
                );
                child.kill().await?;
            }
        }

        let _ = tokio::fs::remove_file(&request.shutdown_file).await;
        Ok(())
    }
}

fn spawn_reader<R>(
    reader: R,
    is_stderr: bool,
    sink: Arc<dyn OutputSink>,
    activity: mpsc::UnboundedSender<()>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                sink.stderr_line(&line);
            } else {
                sink.stdout_line(&line);
            }
            let _ = activity.send(());
        }
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        sink: Arc<dyn OutputSink>,
    ) -> io::Result<ExitOutcome> {
        // A shutdown file left by a previous instance would stop this one at once
        let _ = tokio::fs::remove_file(&request.shutdown_file).await;

        let mut child = Command::new(&request.program)
            .args(&request.args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            "Started {} job {} (pid {:?}): {} {:?}",
            request.kind,
            request.job_name,
            child.id(),
            request.program,
            request.args
        );

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, false, Arc::clone(&sink), activity_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, true, Arc::clone(&sink), activity_tx));
        }

        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
        let mut last_activity = Instant::now();

        let outcome = loop {
            let idle_deadline = request.idle_timeout.map(|idle| last_activity + idle);
            tokio::select! {
                status = child.wait() => {
                    break ExitOutcome::Exited { code: status?.code() };
                }
                Some(()) = activity_rx.recv() => {
                    last_activity = Instant::now();
                }
                _ = sleep_until(idle_deadline) => {
                    warn!("Job {} produced no output for {:?}, stopping", request.job_name, request.idle_timeout);
                    Self::stop(&mut child, &request).await?;
                    break ExitOutcome::IdleTimeout;
                }
                _ = sleep_until(deadline) => {
                    warn!("Job {} exceeded its timeout of {:?}, stopping", request.job_name, request.timeout);
                    Self::stop(&mut child, &request).await?;
                    break ExitOutcome::TimedOut;
                }
                _ = request.cancel.cancelled() => {
                    info!("Stopping job {}", request.job_name);
                    Self::stop(&mut child, &request).await?;
                    break ExitOutcome::Cancelled;
                }
            }
        };

        for reader in readers {
            if time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Output of job {} still open after exit", request.job_name);
            }
        }

        info!("Job {} finished: {:?}", request.job_name, outcome);
        Ok(outcome)
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    fn request(dir: &std::path::Path, script: &str) -> ExecutionRequest {
        ExecutionRequest {
            job_name: "test".to_string(),
            kind: JobKind::Triggered,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.to_path_buf(),
            env: vec![(
                "WEBJOBS_SHUTDOWN_FILE".to_string(),
                dir.join("shutdown").to_string_lossy().into_owned(),
            )],
            shutdown_file: dir.join("shutdown"),
            stopping_wait: Duration::from_millis(200),
            idle_timeout: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());

        let outcome = ProcessExecutor::new()
            .execute(
                request(dir.path(), "echo hello; echo oops 1>&2; exit 3"),
                sink.clone(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ExitOutcome::Exited { code: Some(3) });
        let lines = sink.lines();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"ERR oops".to_string()));
    }

    #[tokio::test]
    async fn test_idle_timeout_kills_silent_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "echo start; sleep 30");
        req.idle_timeout = Some(Duration::from_millis(300));

        let started = Instant::now();
        let outcome = ProcessExecutor::new()
            .execute(req, Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        assert_eq!(outcome, ExitOutcome::IdleTimeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_hard_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "while true; do echo tick; sleep 0.05; done");
        req.timeout = Some(Duration::from_millis(300));

        let outcome = ProcessExecutor::new()
            .execute(req, Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        assert_eq!(outcome, ExitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_writes_shutdown_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(
            dir.path(),
            "while [ ! -f \"$WEBJOBS_SHUTDOWN_FILE\" ]; do sleep 0.05; done; echo bye",
        );
        req.stopping_wait = Duration::from_secs(10);
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let sink = Arc::new(RecordingSink::default());
        let outcome = ProcessExecutor::new()
            .execute(req, sink.clone())
            .await
            .unwrap();

        assert_eq!(outcome, ExitOutcome::Cancelled);
        assert_eq!(sink.lines(), vec!["bye".to_string()]);
        assert!(!dir.path().join("shutdown").exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "");
        req.program = "definitely-not-a-real-program".to_string();

        let result = ProcessExecutor::new()
            .execute(req, Arc::new(RecordingSink::default()))
            .await;

        assert!(result.is_err());
    }
}
