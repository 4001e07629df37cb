//! Process execution and management.
//!
//! This module contains the `ProcessRegistry`, which owns every live runner:
//! it spawns child processes from their definitions, captures their output
//! streams into bounded indexed buffers, and reaps exits. A runner entry
//! exists in the registry exactly while its process is live; recently exited
//! runners keep their final buffers in a small retired store so logs remain
//! readable shortly after exit.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ProcessDefinition;
use crate::error::RegistryError;
use crate::output::{sanitize_line, LogBuffer, LogSlice, StreamKind, StreamMeta};

/// How many exited runners keep their buffers readable.
const MAX_RETIRED: usize = 16;

/// Lifecycle state of a live runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of a live runner, as reported by `snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerMeta {
    pub pid: Option<u32>,
    pub status: RunnerStatus,
    /// Unix timestamp (seconds) of the spawn.
    pub started_at: u64,
    pub stdout: StreamMeta,
    pub stderr: StreamMeta,
}

/// Result of a stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    /// Whether the process exited within the grace period, before the
    /// forced kill.
    pub graceful: bool,
}

struct RunnerEntry {
    status: RunnerStatus,
    pid: Option<u32>,
    started_at: u64,
    stdout: LogBuffer,
    stderr: LogBuffer,
}

/// Shared handle for one live runner.
///
/// The monitor task, the capture tasks, and registry queries all hold an
/// `Arc` to the same handle; the mutable state lives behind a plain mutex
/// that is never held across an await point.
struct EntryHandle {
    name: String,
    inner: Mutex<RunnerEntry>,
    /// Flips to `true` exactly once, when the monitor has reaped the exit.
    exited: watch::Sender<bool>,
    /// Requests an immediate kill from the monitor task.
    kill: Notify,
}

struct RetiredEntry {
    name: String,
    stdout: LogBuffer,
    stderr: LogBuffer,
}

/// Registry of live runners keyed by definition name.
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, Arc<EntryHandle>>>,
    retired: Mutex<VecDeque<RetiredEntry>>,
    retention_lines: usize,
    stop_grace: Duration,
}

impl ProcessRegistry {
    pub fn new(retention_lines: usize, stop_grace: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retired: Mutex::new(VecDeque::new()),
            retention_lines,
            stop_grace,
        }
    }

    /// Spawns the process described by `def` and registers it under its name.
    ///
    /// Fails with `AlreadyRunning` if the name has a live runner, with
    /// `OperationInFlight` if a start or stop for it has not settled, and
    /// with `Spawn` if the OS rejects the process; a failed spawn leaves no
    /// entry behind.
    pub fn start(self: &Arc<Self>, def: &ProcessDefinition) -> Result<u32, RegistryError> {
        let name = def.name.clone();
        let handle = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(existing) = entries.get(&name) {
                let status = existing.inner.lock().unwrap().status;
                return Err(match status {
                    RunnerStatus::Running => RegistryError::AlreadyRunning { name },
                    _ => RegistryError::OperationInFlight { name },
                });
            }
            let (exited, _) = watch::channel(false);
            let handle = Arc::new(EntryHandle {
                name: name.clone(),
                inner: Mutex::new(RunnerEntry {
                    status: RunnerStatus::Starting,
                    pid: None,
                    started_at: unix_now(),
                    stdout: LogBuffer::new(self.retention_lines),
                    stderr: LogBuffer::new(self.retention_lines),
                }),
                exited,
                kill: Notify::new(),
            });
            entries.insert(name.clone(), Arc::clone(&handle));
            handle
        };

        let mut child = match shell_command(def).spawn() {
            Ok(child) => child,
            Err(source) => {
                self.entries.lock().unwrap().remove(&name);
                return Err(RegistryError::Spawn { name, source });
            }
        };
        let pid = child.id();
        {
            let mut entry = handle.inner.lock().unwrap();
            entry.pid = pid;
            entry.status = RunnerStatus::Running;
        }
        self.retired
            .lock()
            .unwrap()
            .retain(|retired| retired.name != name);
        info!(name = %name, pid, "process started");

        let mut captures = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            captures.push(tokio::spawn(capture_stream(
                Arc::clone(&handle),
                StreamKind::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(tokio::spawn(capture_stream(
                Arc::clone(&handle),
                StreamKind::Stderr,
                stderr,
            )));
        }
        tokio::spawn(Arc::clone(self).monitor(handle, child, captures));

        Ok(pid.unwrap_or(0))
    }

    /// Stops the runner under `name`: a termination signal, a bounded wait
    /// for the exit, then a forced kill if the process outlives the grace
    /// period. The returned outcome says which way it went.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, RegistryError> {
        let handle = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::NotRunning {
                    name: name.to_string(),
                })?
        };

        let pid = {
            let mut entry = handle.inner.lock().unwrap();
            if entry.status != RunnerStatus::Running {
                return Err(RegistryError::OperationInFlight {
                    name: name.to_string(),
                });
            }
            entry.status = RunnerStatus::Stopping;
            entry.pid
        };

        if let Some(pid) = pid {
            send_stop_signal(pid);
        }

        let mut exited = handle.exited.subscribe();
        if tokio::time::timeout(self.stop_grace, wait_exited(&mut exited))
            .await
            .is_ok()
        {
            return Ok(StopOutcome { graceful: true });
        }

        warn!(name = %name, grace_ms = self.stop_grace.as_millis() as u64, "grace period expired, killing");
        handle.kill.notify_one();
        wait_exited(&mut exited).await;
        Ok(StopOutcome { graceful: false })
    }

    /// Returns retained lines with index greater than `since` for both
    /// streams, from the live runner or, after exit, from the retired store.
    pub fn read_logs(&self, name: &str, since: i64) -> Result<LogSlice, RegistryError> {
        let handle = self.entries.lock().unwrap().get(name).cloned();
        if let Some(handle) = handle {
            let entry = handle.inner.lock().unwrap();
            return Ok(slice_streams(&entry.stdout, &entry.stderr, since));
        }
        let retired = self.retired.lock().unwrap();
        retired
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| slice_streams(&entry.stdout, &entry.stderr, since))
            .ok_or_else(|| RegistryError::NotRunning {
                name: name.to_string(),
            })
    }

    /// Point-in-time view of every live runner. Retired runners are never
    /// listed; an entry here means the process is live.
    pub fn snapshot(&self) -> HashMap<String, RunnerMeta> {
        let handles: Vec<Arc<EntryHandle>> =
            self.entries.lock().unwrap().values().cloned().collect();
        handles
            .into_iter()
            .map(|handle| {
                let entry = handle.inner.lock().unwrap();
                let meta = RunnerMeta {
                    pid: entry.pid,
                    status: entry.status,
                    started_at: entry.started_at,
                    stdout: entry.stdout.meta(),
                    stderr: entry.stderr.meta(),
                };
                (handle.name.clone(), meta)
            })
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Owns the child for its whole life: waits for the exit (or a kill
    /// request), drains the capture tasks, then moves the buffers into the
    /// retired store and removes the entry.
    async fn monitor(
        self: Arc<Self>,
        handle: Arc<EntryHandle>,
        mut child: Child,
        captures: Vec<JoinHandle<()>>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = handle.kill.notified() => {
                let _ = child.kill().await;
                child.wait().await
            }
        };
        for capture in captures {
            let _ = capture.await;
        }

        match &status {
            Ok(status) => info!(name = %handle.name, code = status.code(), "process exited"),
            Err(err) => warn!(name = %handle.name, error = %err, "failed to reap process"),
        }

        let (stdout, stderr) = {
            let mut entry = handle.inner.lock().unwrap();
            let stdout = std::mem::replace(&mut entry.stdout, LogBuffer::new(1));
            let stderr = std::mem::replace(&mut entry.stderr, LogBuffer::new(1));
            (stdout, stderr)
        };
        {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&handle.name);
            let mut retired = self.retired.lock().unwrap();
            retired.retain(|entry| entry.name != handle.name);
            retired.push_back(RetiredEntry {
                name: handle.name.clone(),
                stdout,
                stderr,
            });
            while retired.len() > MAX_RETIRED {
                retired.pop_front();
            }
        }
        let _ = handle.exited.send_replace(true);
    }
}

fn slice_streams(stdout: &LogBuffer, stderr: &LogBuffer, since: i64) -> LogSlice {
    let (stdout_lines, stdout_truncated) = stdout.slice_since(since);
    let (stderr_lines, stderr_truncated) = stderr.slice_since(since);
    LogSlice {
        stdout: stdout_lines,
        stderr: stderr_lines,
        stdout_max: stdout.max_index(),
        stderr_max: stderr.max_index(),
        stdout_min: stdout.min_index(),
        stderr_min: stderr.min_index(),
        truncated: stdout_truncated || stderr_truncated,
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    while !*exited.borrow() {
        if exited.changed().await.is_err() {
            return;
        }
    }
}

async fn capture_stream<R>(handle: Arc<EntryHandle>, stream: StreamKind, reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = sanitize_line(&line);
                let mut entry = handle.inner.lock().unwrap();
                match stream {
                    StreamKind::Stdout => entry.stdout.push(line),
                    StreamKind::Stderr => entry.stderr.push(line),
                };
            }
            Ok(None) => break,
            Err(err) => {
                warn!(name = %handle.name, stream = stream.as_str(), error = %err, "stream read failed, killing process");
                handle.kill.notify_one();
                break;
            }
        }
    }
}

/// Builds the command for a definition: the command line runs under the
/// platform shell in the definition's directory, optionally through
/// `direnv exec` so the directory's environment is loaded first.
fn shell_command(def: &ProcessDefinition) -> Command {
    let mut command = if def.use_direnv {
        let mut command = Command::new("direnv");
        command
            .arg("exec")
            .arg(&def.directory)
            .arg(shell_binary())
            .args(shell_args())
            .arg(&def.command);
        command
    } else {
        let mut command = Command::new(shell_binary());
        command.args(shell_args()).arg(&def.command);
        command
    };
    command.current_dir(&def.directory);
    if !def.environment.is_empty() {
        command.envs(&def.environment);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command
}

#[cfg(unix)]
fn shell_binary() -> &'static str {
    "sh"
}

#[cfg(windows)]
fn shell_binary() -> &'static str {
    "cmd"
}

#[cfg(unix)]
fn shell_args() -> &'static [&'static str] {
    &["-c"]
}

#[cfg(windows)]
fn shell_args() -> &'static [&'static str] {
    &["/C"]
}

#[cfg(unix)]
fn send_stop_signal(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(windows)]
fn send_stop_signal(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM; CTRL_BREAK is the closest console signal.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn registry(grace: Duration) -> Arc<ProcessRegistry> {
        Arc::new(ProcessRegistry::new(100, grace))
    }

    fn definition(name: &str, command: &str) -> ProcessDefinition {
        ProcessDefinition {
            name: name.to_string(),
            directory: std::env::temp_dir(),
            command: command.to_string(),
            use_direnv: false,
            environment: HashMap::new(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 10s");
    }

    #[tokio::test]
    async fn start_rejects_duplicate_then_stop_clears_entry() {
        let registry = registry(Duration::from_secs(5));
        let def = definition("web", "sleep 5");

        let pid = registry.start(&def).unwrap();
        assert!(pid > 0);
        assert!(registry.is_running("web"));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot["web"].status, RunnerStatus::Running);

        match registry.start(&def) {
            Err(RegistryError::AlreadyRunning { name }) => assert_eq!(name, "web"),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }

        let outcome = registry.stop("web").await.unwrap();
        assert!(outcome.graceful);
        assert!(!registry.is_running("web"));
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn stop_without_runner_fails() {
        let registry = registry(Duration::from_secs(1));
        match registry.stop("ghost").await {
            Err(RegistryError::NotRunning { name }) => assert_eq!(name, "ghost"),
            other => panic!("expected NotRunning, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn captures_output_and_serves_incremental_reads() {
        let registry = registry(Duration::from_secs(1));
        let def = definition("printer", "printf 'a\\nb\\nc\\n'");
        registry.start(&def).unwrap();

        wait_until(|| {
            registry
                .read_logs("printer", -1)
                .map(|slice| slice.stdout_max == 2)
                .unwrap_or(false)
        })
        .await;

        let slice = registry.read_logs("printer", -1).unwrap();
        assert_eq!(slice.stdout, vec!["a", "b", "c"]);
        assert!(slice.stderr.is_empty());
        assert_eq!(slice.stderr_max, -1);
        assert!(!slice.truncated);

        let rest = registry.read_logs("printer", 1).unwrap();
        assert_eq!(rest.stdout, vec!["c"]);
        let none = registry.read_logs("printer", 2).unwrap();
        assert!(none.stdout.is_empty());

        // The buffers stay readable from the retired store after exit.
        wait_until(|| !registry.is_running("printer")).await;
        assert!(registry.snapshot().is_empty());
        let retired = registry.read_logs("printer", -1).unwrap();
        assert_eq!(retired.stdout, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn natural_exit_frees_name_for_restart() {
        let registry = registry(Duration::from_secs(1));
        let def = definition("oneshot", "true");
        registry.start(&def).unwrap();
        wait_until(|| !registry.is_running("oneshot")).await;

        registry.start(&def).unwrap();
        assert!(registry.is_running("oneshot"));
        registry.stop("oneshot").await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_entry() {
        let registry = registry(Duration::from_secs(1));
        let mut def = definition("broken", "true");
        def.directory = "/nonexistent/path/for/procman/tests".into();

        match registry.start(&def) {
            Err(RegistryError::Spawn { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("expected Spawn, got {:?}", other.map(|_| ())),
        }
        assert!(!registry.is_running("broken"));

        // The failed attempt must not leave a conflicting reservation.
        match registry.start(&def) {
            Err(RegistryError::Spawn { .. }) => {}
            other => panic!("expected Spawn, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed() {
        let registry = registry(Duration::from_millis(200));
        let def = definition("stubborn", "trap '' TERM; sleep 30");
        registry.start(&def).unwrap();

        wait_until(|| {
            registry
                .snapshot()
                .get("stubborn")
                .map(|meta| meta.status == RunnerStatus::Running)
                .unwrap_or(false)
        })
        .await;

        let outcome = registry.stop("stubborn").await.unwrap();
        assert!(!outcome.graceful);
        assert!(!registry.is_running("stubborn"));
    }

    #[tokio::test]
    async fn environment_reaches_the_child() {
        let registry = registry(Duration::from_secs(1));
        let mut def = definition("env", "printf '%s\\n' \"$PROCMAN_TEST_VALUE\"");
        def.environment
            .insert("PROCMAN_TEST_VALUE".to_string(), "from-definition".to_string());
        registry.start(&def).unwrap();

        wait_until(|| {
            registry
                .read_logs("env", -1)
                .map(|slice| slice.stdout_max >= 0)
                .unwrap_or(false)
        })
        .await;
        let slice = registry.read_logs("env", -1).unwrap();
        assert_eq!(slice.stdout, vec!["from-definition"]);
    }
}
