use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{fs, sync::mpsc};

use crate::{
    forward::{LineSink, SinkKind},
    PipelineError,
};

/// Default I/O buffer size (10 MiB). Lines may use up to half of it.
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// How long a stage gets to exit after SIGTERM before it is killed outright.
/// Smallest buffer that still permits one byte per line.
pub const MIN_BUFFER_SIZE: usize = 2;

pub const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageRole {
    Extractor,
    Mapper,
    Loader,
}

impl StageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StageRole::Extractor => "extractor",
            StageRole::Mapper => "mapper",
            StageRole::Loader => "loader",
        }
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line-length policy shared by every forwarder of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub buffer_size: usize,
}

impl BufferPolicy {
    /// Sizes below [`MIN_BUFFER_SIZE`] are raised to it so the line limit never drops to zero.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(MIN_BUFFER_SIZE),
        }
    }

    /// Largest permitted line, excluding its trailing newline.
    pub fn max_line_bytes(&self) -> usize {
        self.buffer_size / 2
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A fully resolved plugin invocation. No further expansion happens on any field.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub name: String,
    pub role: StageRole,
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl StageCommand {
    pub fn new(name: impl Into<String>, role: StageRole, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            role,
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-style rendering used by `validate` and log lines.
    pub fn display_command(&self) -> String {
        let mut rendered = self.executable.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

/// Where a copy of a stage stream should go.
#[derive(Debug, Clone)]
pub enum CaptureTarget {
    /// Appended to, parent directories created, flushed after every line.
    File(PathBuf),
    /// Each line (newline included) is sent as one message.
    Channel(mpsc::UnboundedSender<Vec<u8>>),
}

impl CaptureTarget {
    pub(crate) async fn open(&self, name: String) -> Result<LineSink, PipelineError> {
        match self {
            CaptureTarget::File(path) => {
                let file = open_append(path).await.map_err(|source| PipelineError::Capture {
                    path: path.clone(),
                    source,
                })?;
                Ok(LineSink::writer(name, SinkKind::Capture, file).flush_each_line(true))
            }
            CaptureTarget::Channel(tx) => Ok(LineSink::channel(name, tx.clone())),
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    pub stdout: Option<CaptureTarget>,
    pub stderr: Option<CaptureTarget>,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub command: StageCommand,
    pub capture: OutputCapture,
}

impl Stage {
    pub fn new(command: StageCommand) -> Self {
        Self {
            command,
            capture: OutputCapture::default(),
        }
    }

    pub fn capture_stdout(mut self, target: CaptureTarget) -> Self {
        self.capture.stdout = Some(target);
        self
    }

    pub fn capture_stderr(mut self, target: CaptureTarget) -> Self {
        self.capture.stderr = Some(target);
        self
    }

    pub fn name(&self) -> &str {
        &self.command.name
    }

    pub fn role(&self) -> StageRole {
        self.command.role
    }
}

impl From<StageCommand> for Stage {
    fn from(command: StageCommand) -> Self {
        Stage::new(command)
    }
}

/// Everything a [`crate::PipelineRunner`] needs for one run.
#[derive(Debug, Clone)]
pub struct EltContext {
    pub extractor: Stage,
    pub mapper: Option<Stage>,
    pub loader: Stage,
    pub buffer: BufferPolicy,
    pub kill_grace_period: Duration,
}

impl EltContext {
    pub fn builder(extractor: impl Into<Stage>, loader: impl Into<Stage>) -> EltContextBuilder {
        EltContextBuilder {
            extractor: extractor.into(),
            mapper: None,
            loader: loader.into(),
            buffer: BufferPolicy::default(),
            kill_grace_period: DEFAULT_KILL_GRACE_PERIOD,
        }
    }

    /// Stages in spawn order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        std::iter::once(&self.extractor)
            .chain(self.mapper.iter())
            .chain(std::iter::once(&self.loader))
    }
}

#[derive(Debug, Clone)]
pub struct EltContextBuilder {
    extractor: Stage,
    mapper: Option<Stage>,
    loader: Stage,
    buffer: BufferPolicy,
    kill_grace_period: Duration,
}

impl EltContextBuilder {
    pub fn mapper(mut self, mapper: impl Into<Stage>) -> Self {
        self.mapper = Some(mapper.into());
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer = BufferPolicy::new(buffer_size);
        self
    }

    pub fn kill_grace_period(mut self, grace: Duration) -> Self {
        self.kill_grace_period = grace;
        self
    }

    pub fn build(self) -> EltContext {
        EltContext {
            extractor: self.extractor,
            mapper: self.mapper,
            loader: self.loader,
            buffer: self.buffer,
            kill_grace_period: self.kill_grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_limit_is_half_the_buffer() {
        assert_eq!(BufferPolicy::new(1024).max_line_bytes(), 512);
        assert_eq!(BufferPolicy::default().max_line_bytes(), 5 * 1024 * 1024);
    }

    #[test]
    fn tiny_buffer_sizes_are_raised_to_the_minimum() {
        for requested in [0, 1] {
            let context = EltContext::builder(
                StageCommand::new("tap", StageRole::Extractor, "tap"),
                StageCommand::new("target", StageRole::Loader, "target"),
            )
            .buffer_size(requested)
            .build();
            assert_eq!(context.buffer.buffer_size, MIN_BUFFER_SIZE);
            assert_eq!(context.buffer.max_line_bytes(), 1);
        }
    }

    #[test]
    fn stages_iterate_in_spawn_order() {
        let ctx = EltContext::builder(
            StageCommand::new("tap-csv", StageRole::Extractor, "tap-csv"),
            StageCommand::new("target-jsonl", StageRole::Loader, "target-jsonl"),
        )
        .mapper(StageCommand::new("mask", StageRole::Mapper, "meltano-map"))
        .build();

        let names: Vec<_> = ctx.stages().map(Stage::name).collect();
        assert_eq!(names, ["tap-csv", "mask", "target-jsonl"]);
    }

    #[test]
    fn display_command_joins_args() {
        let cmd = StageCommand::new("tap", StageRole::Extractor, "/usr/bin/tap")
            .args(["--config", "tap.json"]);
        assert_eq!(cmd.display_command(), "/usr/bin/tap --config tap.json");
    }
}
