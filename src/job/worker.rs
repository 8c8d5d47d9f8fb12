use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use super::models::JobConfig;
use crate::errors::WorkerError;

/// Something the worker did, in the order it happened.
///
/// `Exited` is always the last event of a run and is delivered only after
/// both output streams reached end-of-file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
}

/// Control half of a spawned worker.
pub trait WorkerControl: Send + Sync {
    /// Ask the worker to stop. Cooperative: there is no escalation.
    fn terminate(&self) -> Result<(), WorkerError>;

    /// OS process id, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A freshly spawned worker: how to stop it and where its events arrive.
pub struct SpawnedWorker {
    pub control: Box<dyn WorkerControl>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Abstraction over the external generator for testability.
/// Real implementation: `ProcessWorker`.
///
/// `spawn` is synchronous so the controller can start the worker and mark
/// the job slot as running inside one critical section.
pub trait Worker: Send + Sync {
    fn spawn(&self, config: &JobConfig) -> Result<SpawnedWorker, WorkerError>;
}

/// Runs the generator as a child process.
///
/// The command line is `<program> <args...> --charset <c> --min <n> --max <m>`,
/// run inside `working_dir`, which is also where the artifacts land.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ProcessWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
        }
    }

    fn build_command(&self, config: &JobConfig) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--charset")
            .arg(&config.charset)
            .arg("--min")
            .arg(config.min.to_string())
            .arg("--max")
            .arg(config.max.to_string())
            .env("PYTHONUNBUFFERED", "1")
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Worker for ProcessWorker {
    fn spawn(&self, config: &JobConfig) -> Result<SpawnedWorker, WorkerError> {
        let mut child = self
            .build_command(config)
            .spawn()
            .map_err(|source| WorkerError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(WorkerError::MissingPipe {
                stream: "stdout/stderr",
            });
        };

        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let exited_flag = Arc::clone(&exited);
        tokio::spawn(async move {
            tokio::join!(
                forward_lines(stdout, tx.clone(), WorkerEvent::Stdout),
                forward_lines(stderr, tx.clone(), WorkerEvent::Stderr),
            );

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for worker process");
                    None
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = tx.send(WorkerEvent::Exited(code));
        });

        tracing::debug!(pid = ?pid, program = %self.program, "Worker spawned");

        Ok(SpawnedWorker {
            control: Box::new(ProcessControl { pid, exited }),
            events: rx,
        })
    }
}

/// Forward every line of `reader` as an event until end-of-file.
///
/// Lines are decoded lossily so a stray non-UTF-8 byte never ends the stream.
async fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<WorkerEvent>,
    wrap: fn(String) -> WorkerEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches('\r').to_string();
                if tx.send(wrap(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read worker output");
                break;
            }
        }
    }
}

struct ProcessControl {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl WorkerControl for ProcessControl {
    fn terminate(&self) -> Result<(), WorkerError> {
        // Once reaped the pid may be reused by an unrelated process.
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let raw = i32::try_from(pid).map_err(|_| WorkerError::SignalFailed {
            pid,
            message: "pid out of range".into(),
        })?;

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(WorkerError::SignalFailed {
                pid,
                message: e.to_string(),
            }),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    async fn collect(mut spawned: SpawnedWorker) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(5), spawned.events.recv()).await.unwrap()
        {
            let done = matches!(event, WorkerEvent::Exited(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_process_worker_passes_config_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "args.sh", "echo \"$@\"\n");
        let worker = ProcessWorker::new(script, vec![], dir.path());

        let spawned = worker.spawn(&JobConfig::new("abc", 1, 2)).unwrap();
        let events = collect(spawned).await;

        assert_eq!(
            events,
            vec![
                WorkerEvent::Stdout("--charset abc --min 1 --max 2".to_string()),
                WorkerEvent::Exited(Some(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_process_worker_prefix_args_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ProcessWorker::new("echo", vec!["-n".into(), "gen".into()], dir.path());

        let events = collect(worker.spawn(&JobConfig::new("x", 0, 1)).unwrap()).await;
        assert_eq!(events[0], WorkerEvent::Stdout("gen --charset x --min 0 --max 1".to_string()));
    }

    #[tokio::test]
    async fn test_process_worker_separates_streams_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mixed.sh", "echo 1\necho oops >&2\necho 2\nexit 3\n");
        let worker = ProcessWorker::new(script, vec![], dir.path());

        let events = collect(worker.spawn(&JobConfig::new("a", 1, 1)).unwrap()).await;

        let stdout: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Stdout(l) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["1", "2"]);
        assert!(events.contains(&WorkerEvent::Stderr("oops".to_string())));
        assert_eq!(events.last(), Some(&WorkerEvent::Exited(Some(3))));
    }

    #[tokio::test]
    async fn test_process_worker_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "touch.sh", "echo data > output.txt\n");
        let worker = ProcessWorker::new(script, vec![], dir.path());

        collect(worker.spawn(&JobConfig::new("a", 1, 1)).unwrap()).await;
        assert!(dir.path().join("output.txt").exists());
    }

    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep.sh", "echo ready\nexec sleep 30\n");
        let worker = ProcessWorker::new(script, vec![], dir.path());

        let mut spawned = worker.spawn(&JobConfig::new("a", 1, 1)).unwrap();
        assert!(spawned.control.pid().is_some());
        let first = spawned.events.recv().await.unwrap();
        assert_eq!(first, WorkerEvent::Stdout("ready".to_string()));

        spawned.control.terminate().unwrap();
        let events = collect(spawned).await;
        // Killed by a signal: no exit code.
        assert_eq!(events.last(), Some(&WorkerEvent::Exited(None)));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ProcessWorker::new("/nonexistent/omnigen-worker", vec![], dir.path());
        match worker.spawn(&JobConfig::new("a", 1, 1)) {
            Err(WorkerError::SpawnFailed { program, .. }) => {
                assert_eq!(program, "/nonexistent/omnigen-worker");
            }
            other => panic!("Expected SpawnFailed, got {:?}", other.map(|_| ())),
        }
    }
}
