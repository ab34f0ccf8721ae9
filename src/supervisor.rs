//! Worker process lifecycle: spawn, output drain, forced termination.
//!
//! No protocol logic lives here. Two passive tasks drain the worker's
//! stdout/stderr so it can never block on a full pipe; stderr is mirrored
//! into a [`Diagnostics`] buffer that fatal bridge errors attach.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

use crate::bridge::protocol::MODE_TAG;
use crate::config::BridgeConfig;

/// Captured worker stderr, attached to fatal bridge errors.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics(Arc<Mutex<String>>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append_line(&self, line: &str) {
        if let Ok(mut buffer) = self.0.lock() {
            buffer.push_str(line);
            buffer.push('\n');
        }
    }

    /// Current contents of the buffer.
    pub fn snapshot(&self) -> String {
        self.0.lock().map(|buffer| buffer.clone()).unwrap_or_default()
    }
}

/// What a spawner needs to build the worker command line.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub interpreter: PathBuf,
    pub plan_path: PathBuf,
    pub arguments: Vec<String>,
}

impl WorkerLaunch {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            interpreter: config.interpreter(),
            plan_path: config.plan_path.clone(),
            arguments: config.plan_arguments.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} was not captured; spawners must pipe all three stdio streams")]
    Stdio(&'static str),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin/stdout/stderr and should set
/// `kill_on_drop` so the worker dies with its owning task even without an
/// orderly `close()`.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Default spawner: runs the plan under the configured Python interpreter.
pub struct PythonSpawner;

impl WorkerSpawner for PythonSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError> {
        let child = Command::new(&launch.interpreter)
            .arg("-O")
            .arg("-B")
            .arg(&launch.plan_path)
            .args(&launch.arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Handle to the spawned worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    destroyed: bool,
}

impl WorkerProcess {
    /// Spawn the worker and start draining its output.
    pub fn launch(
        spawner: &dyn WorkerSpawner,
        launch: &WorkerLaunch,
        diagnostics: Diagnostics,
    ) -> Result<Self, SpawnError> {
        let mut child = spawner.spawn(launch)?;

        let stdin = child.stdin.take().ok_or(SpawnError::Stdio("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Stdio("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::Stdio("stderr"))?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "pybridge::worker", "{}", line);
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                diagnostics.append_line(&line);
                tracing::warn!(target: "pybridge::worker", "{}", line);
            }
        });

        Ok(Self {
            child,
            stdin,
            destroyed: false,
        })
    }

    /// Write the handshake preamble to the worker's stdin.
    ///
    /// The stdin handle stays open afterwards; the worker reads exactly
    /// these five lines before connecting back on the announced port.
    pub async fn write_preamble(
        &mut self,
        port: u16,
        operator_id: u32,
        input_path: &Path,
        output_path: &Path,
    ) -> io::Result<()> {
        self.stdin
            .write_all(&preamble(port, operator_id, input_path, output_path))
            .await?;
        self.stdin.flush().await
    }

    /// Non-blocking exit probe.
    pub fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Forcibly terminate the worker if it is still running, then reap it.
    ///
    /// On Unix the native pid gets an unconditional SIGKILL; when the pid
    /// cannot be resolved this degrades to the generic kill rather than
    /// aborting shutdown. Tolerates a worker that already exited; attempted
    /// at most once per process.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "Worker already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not query worker state before kill");
            }
        }

        if !self.kill_by_pid() {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!(error = %e, "Generic worker kill failed");
            }
        }

        match self.child.wait().await {
            Ok(status) => tracing::debug!(%status, "Worker terminated"),
            Err(e) => tracing::warn!(error = %e, "Failed to reap worker"),
        }
    }

    #[cfg(unix)]
    fn kill_by_pid(&self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pid, error = %e, "SIGKILL by pid failed, falling back to generic kill");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_by_pid(&self) -> bool {
        false
    }
}

fn preamble(port: u16, operator_id: u32, input_path: &Path, output_path: &Path) -> Vec<u8> {
    format!(
        "{MODE_TAG}\n{port}\n{operator_id}\n{}\n{}\n",
        input_path.display(),
        output_path.display()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ShellSpawner(&'static str);

    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self, _launch: &WorkerLaunch) -> Result<Child, SpawnError> {
            let child = Command::new("sh")
                .arg("-c")
                .arg(self.0)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            Ok(child)
        }
    }

    struct NoStdinSpawner;

    impl WorkerSpawner for NoStdinSpawner {
        fn spawn(&self, _launch: &WorkerLaunch) -> Result<Child, SpawnError> {
            let child = Command::new("sh")
                .arg("-c")
                .arg("true")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            Ok(child)
        }
    }

    fn launch_spec() -> WorkerLaunch {
        WorkerLaunch {
            interpreter: PathBuf::from("sh"),
            plan_path: PathBuf::from("/dev/null"),
            arguments: Vec::new(),
        }
    }

    async fn wait_for_exit(process: &mut WorkerProcess) -> ExitStatus {
        for _ in 0..250 {
            if let Ok(Some(status)) = process.poll_exit() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker did not exit in time");
    }

    #[test]
    fn preamble_layout() {
        let bytes = preamble(
            4711,
            9,
            Path::new("/tmp/bridge-9-0.input"),
            Path::new("/tmp/bridge-9-0.output"),
        );
        assert_eq!(
            bytes,
            b"operator\n4711\n9\n/tmp/bridge-9-0.input\n/tmp/bridge-9-0.output\n"
        );
    }

    #[test]
    fn diagnostics_snapshot_accumulates_lines() {
        let diagnostics = Diagnostics::new();
        diagnostics.append_line("Traceback (most recent call last):");
        diagnostics.append_line("SyntaxError: invalid syntax");
        let text = diagnostics.snapshot();
        assert!(text.contains("Traceback"));
        assert!(text.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn stderr_is_captured_as_diagnostics() {
        let diagnostics = Diagnostics::new();
        let mut process = WorkerProcess::launch(
            &ShellSpawner("echo ordinary output; echo failure-detail >&2"),
            &launch_spec(),
            diagnostics.clone(),
        )
        .unwrap();

        wait_for_exit(&mut process).await;
        for _ in 0..250 {
            if diagnostics.snapshot().contains("failure-detail") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(diagnostics.snapshot().contains("failure-detail"));
        assert!(!diagnostics.snapshot().contains("ordinary output"));
    }

    #[tokio::test]
    async fn destroy_kills_a_running_worker() {
        let mut process = WorkerProcess::launch(
            &ShellSpawner("sleep 30"),
            &launch_spec(),
            Diagnostics::new(),
        )
        .unwrap();

        assert!(process.poll_exit().unwrap().is_none());
        process.destroy().await;

        let status = process.poll_exit().unwrap().expect("worker must be reaped");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn destroy_tolerates_an_exited_worker() {
        let mut process = WorkerProcess::launch(
            &ShellSpawner("exit 0"),
            &launch_spec(),
            Diagnostics::new(),
        )
        .unwrap();

        wait_for_exit(&mut process).await;
        process.destroy().await;
        process.destroy().await;
        assert!(process.poll_exit().unwrap().is_some());
    }

    #[tokio::test]
    async fn spawner_without_piped_stdin_is_rejected() {
        let err = WorkerProcess::launch(&NoStdinSpawner, &launch_spec(), Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, SpawnError::Stdio("stdin")));
    }

    #[tokio::test]
    async fn preamble_reaches_the_worker() {
        // The worker echoes the preamble's port line back on stderr, where
        // the drain makes it observable through diagnostics.
        let diagnostics = Diagnostics::new();
        let mut process = WorkerProcess::launch(
            &ShellSpawner("read mode; read port; echo \"port=$port\" >&2"),
            &launch_spec(),
            diagnostics.clone(),
        )
        .unwrap();

        process
            .write_preamble(
                4711,
                1,
                Path::new("/tmp/in"),
                Path::new("/tmp/out"),
            )
            .await
            .unwrap();

        wait_for_exit(&mut process).await;
        for _ in 0..250 {
            if diagnostics.snapshot().contains("port=4711") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(diagnostics.snapshot().contains("port=4711"));
    }
}
