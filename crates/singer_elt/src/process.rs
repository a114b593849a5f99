use std::{io, process::ExitStatus, time::Duration};

use tokio::{
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    time,
};
use tracing::{debug, info, warn};

use crate::{PipelineError, StageCommand, StageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Piped,
    Inherit,
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> std::process::Stdio {
        match self {
            StdioMode::Piped => std::process::Stdio::piped(),
            StdioMode::Inherit => std::process::Stdio::inherit(),
            StdioMode::Null => std::process::Stdio::null(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioConfig {
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl StdioConfig {
    pub fn piped() -> Self {
        Self {
            stdin: StdioMode::Piped,
            stdout: StdioMode::Piped,
            stderr: StdioMode::Piped,
        }
    }

    /// Stdin closed from the start; used for the extractor.
    pub fn producer() -> Self {
        Self {
            stdin: StdioMode::Null,
            ..Self::piped()
        }
    }
}

/// One supervised plugin subprocess.
///
/// The exit status is cached the first time it is observed, so [`ProcessHandle::wait`] and
/// [`ProcessHandle::kill`] may be called any number of times.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    role: StageRole,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status: Option<ExitStatus>,
    killed: bool,
}

impl ProcessHandle {
    pub async fn spawn(command: &StageCommand, stdio: StdioConfig) -> Result<Self, PipelineError> {
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .stdin(stdio.stdin.to_stdio())
            .stdout(stdio.stdout.to_stdio())
            .stderr(stdio.stderr.to_stdio())
            .kill_on_drop(true);

        if let Some(dir) = command.cwd.as_ref() {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = spawn_with_retry(&mut cmd)
            .await
            .map_err(|source| PipelineError::Spawn {
                stage: command.name.clone(),
                role: command.role,
                binary: command.executable.clone(),
                source,
            })?;

        let pid = child.id();
        info!(
            plugin = %command.name,
            role = %command.role,
            pid = ?pid,
            command = %command.display_command(),
            "stage started"
        );

        Ok(Self {
            name: command.name.clone(),
            role: command.role,
            pid,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            status: None,
            killed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, PipelineError> {
        self.stdin.take().ok_or_else(|| self.missing("stdin"))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, PipelineError> {
        self.stdout.take().ok_or_else(|| self.missing("stdout"))
    }

    pub fn take_stderr(&mut self) -> Result<ChildStderr, PipelineError> {
        self.stderr.take().ok_or_else(|| self.missing("stderr"))
    }

    fn missing(&self, stream: &'static str) -> PipelineError {
        PipelineError::MissingPipe {
            stage: self.name.clone(),
            stream,
        }
    }

    /// Exit status if it has already been observed.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn has_exited(&self) -> bool {
        self.status.is_some()
    }

    /// Whether the pipeline had to signal this process.
    pub fn was_killed(&self) -> bool {
        self.killed
    }

    /// Suspends until the process exits. Cancel safe.
    pub async fn wait(&mut self) -> Result<ExitStatus, PipelineError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(|source| PipelineError::Wait {
            stage: self.name.clone(),
            role: self.role,
            source,
        })?;
        self.record_exit(status);
        Ok(status)
    }

    fn try_status(&mut self) -> Result<Option<ExitStatus>, PipelineError> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        let polled = self.child.try_wait().map_err(|source| PipelineError::Wait {
            stage: self.name.clone(),
            role: self.role,
            source,
        })?;
        if let Some(status) = polled {
            self.record_exit(status);
        }
        Ok(polled)
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.status = Some(status);
        if status.success() {
            info!(plugin = %self.name, role = %self.role, %status, "stage exited");
        } else {
            warn!(plugin = %self.name, role = %self.role, %status, "stage exited");
        }
    }

    /// SIGTERM, then SIGKILL once `grace_period` has elapsed. Always reaps the process.
    /// A process that already exited is left alone.
    pub async fn kill(&mut self, grace_period: Duration) -> Result<ExitStatus, PipelineError> {
        if let Some(status) = self.try_status()? {
            return Ok(status);
        }

        self.killed = true;
        warn!(plugin = %self.name, role = %self.role, ?grace_period, "terminating stage");
        self.close_stdin();
        self.terminate();

        if let Ok(result) = time::timeout(grace_period, self.wait()).await {
            return result;
        }

        warn!(plugin = %self.name, role = %self.role, "stage ignored SIGTERM, killing");
        if let Err(err) = self.child.start_kill() {
            // The process may have exited between the timeout and the kill.
            debug!(plugin = %self.name, "start_kill failed: {err}");
        }
        self.wait().await
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.child.id() {
            Some(pid) => {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(plugin = %self.name, "SIGTERM failed: {err}");
                }
            }
            None => debug!(plugin = %self.name, "no pid, process already reaped"),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Drops the write end of stdin if this handle still owns it.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!(plugin = %self.name, role = %self.role, "closed stdin");
        }
    }
}

async fn spawn_with_retry(command: &mut Command) -> Result<Child, io::Error> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                // ETXTBSY: a freshly written script may still be open for writing elsewhere.
                let is_busy = source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    attempt += 1;
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(source);
            }
        }
    }
}
