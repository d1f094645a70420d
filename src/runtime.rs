//! Sandbox runtime: executes one submission at a time in its workspace.
//!
//! A [`Runtime`] owns a single workspace directory and a single environment
//! provider. Every [`Runtime::run`] holds the runtime's lock for its whole
//! duration, so executions on one runtime are totally ordered. Throughput
//! comes from running more worker processes, each with its own workspace.

mod workspace;

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::error::{EnvError, RuntimeError};
use crate::identity::EnvProvider;
use crate::language::Language;

/// Exit code reported when a program is killed for exceeding its time limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long output may stay open once the session has exited and its group
/// was killed. Only a process that left the group can hold a pipe that long.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of running a submission to completion.
///
/// A non-zero `exit_code` is the program's own status, not a runtime failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Wall-clock time from session start to process exit.
    pub duration: Duration,
}

/// Anything that can execute a code submission.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, code: &str) -> Result<RunResult, RuntimeError>;
}

/// Serialized execution engine over one workspace and one identity.
pub struct Runtime {
    lock: Mutex<()>,
    root: PathBuf,
    env: Arc<dyn EnvProvider>,
    language: Language,
    exec_timeout: Duration,
    binary: OnceCell<PathBuf>,
}

impl Runtime {
    pub fn new(
        root: impl Into<PathBuf>,
        env: Arc<dyn EnvProvider>,
        language: Language,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            lock: Mutex::new(()),
            root: root.into(),
            env,
            language,
            exec_timeout,
            binary: OnceCell::new(),
        }
    }

    /// Use `binary` instead of looking the language runtime up on `PATH`.
    #[must_use]
    pub fn with_binary(self, binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: OnceCell::new_with(Some(binary.into())),
            ..self
        }
    }

    /// Absolute path of the language runtime, resolved on first use.
    async fn binary(&self) -> Result<&Path, RuntimeError> {
        let binary = self.language.binary();
        let path = self
            .binary
            .get_or_try_init(|| async {
                which::which(binary)
                    .map_err(|source| RuntimeError::BinaryNotFound { binary, source })
            })
            .await?;
        Ok(path)
    }

    /// Reset the workspace, write the source and run it.
    ///
    /// Dropping the returned future kills the program's process group and
    /// releases the lock.
    #[instrument(skip(self, code), fields(language = %self.language, code_len = code.len()))]
    pub async fn run(&self, code: &str) -> Result<RunResult, RuntimeError> {
        let _guard = self.lock.lock().await;

        let prep_started = Instant::now();
        workspace::reset(&self.root).await?;

        let binary = self.binary().await?;
        if let Some(args) = self.language.init_args() {
            workspace::init(&self.root, binary, args).await?;
        }
        workspace::write_source(&self.root, self.language.entry_file(), code).await?;

        self.env
            .prepare(&self.root)
            .await
            .map_err(|source| RuntimeError::WorkspacePrep {
                path: self.root.clone(),
                source,
            })?;

        let mut cmd = self.env.login(&self.root)?;
        debug!(
            env = %self.env.describe(),
            took = ?prep_started.elapsed(),
            "Finished preparing runtime environment"
        );

        let launch = self.language.launch_line(binary, &self.root);
        self.execute(&mut cmd, &launch).await
    }

    /// Spawn the session, feed it `launch` and capture both output streams.
    async fn execute(
        &self,
        cmd: &mut tokio::process::Command,
        launch: &str,
    ) -> Result<RunResult, RuntimeError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Session(EnvError::Spawn(e)))?;
        let mut group = ProcessGroup::of(child.id());

        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let mut child_stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let mut child_stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        stdin
            .write_all(launch.as_bytes())
            .await
            .map_err(RuntimeError::SystemExec)?;
        drop(stdin); // EOF ends the shell after the launch line

        info!(launch = %launch.trim_end(), "Started execution");

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (exited_tx, exited_rx) = oneshot::channel::<()>();

        // The deadline applies to the session only. Once it exits, whatever
        // it left running in its group is killed so both pipes reach EOF.
        let session = async {
            let status = tokio::time::timeout(self.exec_timeout, child.wait()).await;
            let took = started.elapsed();
            group.kill();
            let _ = exited_tx.send(());
            (status, took)
        };
        let drain = async {
            let reads = async {
                tokio::join!(
                    child_stdout.read_to_end(&mut stdout),
                    child_stderr.read_to_end(&mut stderr),
                )
            };
            tokio::select! {
                (out, err) = reads => {
                    if let Err(e) = out {
                        warn!(error = %e, "Error reading stdout");
                    }
                    if let Err(e) = err {
                        warn!(error = %e, "Error reading stderr");
                    }
                }
                () = async {
                    let _ = exited_rx.await;
                    tokio::time::sleep(DRAIN_GRACE).await;
                } => warn!("Output still open after the session exited, truncating"),
            }
        };
        let ((status, duration), ()) = tokio::join!(session, drain);

        let exit_code = match status {
            Ok(Ok(status)) => status_code(status),
            Ok(Err(e)) => return Err(RuntimeError::SystemExec(e)),
            Err(_) => {
                let _ = child.kill().await;
                warn!(timeout = ?self.exec_timeout, "User code timed out");
                stderr.extend_from_slice(
                    format!(
                        "\nexecution timed out after {}s\n",
                        self.exec_timeout.as_secs_f64()
                    )
                    .as_bytes(),
                );
                TIMEOUT_EXIT_CODE
            }
        };

        if exit_code != 0 {
            warn!(code = exit_code, "Non-zero exitcode running user code");
        }
        info!(
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            took = ?duration,
            "Finished running user code"
        );

        Ok(RunResult {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }
}

#[async_trait]
impl Executor for Runtime {
    async fn run(&self, code: &str) -> Result<RunResult, RuntimeError> {
        Self::run(self, code).await
    }
}

fn missing_pipe(name: &str) -> RuntimeError {
    RuntimeError::SystemExec(std::io::Error::other(format!("{name} was not piped")))
}

/// Exit status as a shell would report it.
fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Process group of a spawned session, killed when dropped.
///
/// Catches whatever the session left behind, including on cancellation.
/// [`ProcessGroup::kill`] disarms the guard, so a group is signalled at most
/// once. On the normal path that happens right after the leader is reaped;
/// the id cannot be handed out again while any member of the group lives.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(pid: Option<u32>) -> Self {
        Self(pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw))
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                // ESRCH: the group is already gone
                if e != nix::errno::Errno::ESRCH {
                    warn!(pgid = %pgid, error = %e, "Failed to kill process group");
                }
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
