use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{forward::SinkKind, StageRole};

/// Errors that prevent a pipeline run from producing a [`crate::RunReport`].
///
/// Stage failures are not errors at this level: a stage that ran and exited non-zero is
/// reported through [`crate::RunOutcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{role} `{stage}` could not be spawned (binary={binary:?}): {source}")]
    Spawn {
        stage: String,
        role: StageRole,
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for {role} `{stage}`: {source}")]
    Wait {
        stage: String,
        role: StageRole,
        #[source]
        source: io::Error,
    },
    #[error("internal error: {stream} pipe of `{stage}` unavailable")]
    MissingPipe { stage: String, stream: &'static str },
    #[error("failed to open capture file `{}`: {source}", .path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A sink a forwarder stopped writing to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedSink {
    pub name: String,
    pub kind: SinkKind,
    pub error_kind: io::ErrorKind,
    pub message: String,
}

impl DroppedSink {
    pub(crate) fn new(name: &str, kind: SinkKind, error: &io::Error) -> Self {
        Self {
            name: name.to_string(),
            kind,
            error_kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(
        "line of {observed} bytes exceeds the limit of {limit} bytes (buffer size {buffer_size})"
    )]
    LineTooLong {
        limit: usize,
        buffer_size: usize,
        observed: usize,
    },
    #[error("every sink failed: {}", describe_dropped(.dropped))]
    SinkFailure { dropped: Vec<DroppedSink> },
    #[error("failed reading source stream: {0}")]
    SourceRead(#[source] io::Error),
}

impl ForwardError {
    /// True when every failed sink was the stdin of a downstream stage, i.e. the consumer
    /// went away rather than some local plumbing breaking.
    pub fn downstream_closed(&self) -> bool {
        match self {
            ForwardError::SinkFailure { dropped } => {
                !dropped.is_empty() && dropped.iter().all(|sink| sink.kind == SinkKind::Stage)
            }
            _ => false,
        }
    }
}

fn describe_dropped(dropped: &[DroppedSink]) -> String {
    dropped
        .iter()
        .map(|sink| format!("{} ({})", sink.name, sink.message))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed reading {stream} of `{plugin}`: {source}")]
    SourceRead {
        plugin: String,
        stream: crate::StreamKind,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while loading or resolving a pipeline file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pipeline file `{}`: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse pipeline file `{}`: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid pipeline: {0}")]
    Invalid(String),
    #[error("{stage}: config file `{}` does not exist", .path.display())]
    MissingConfigFile { stage: String, path: PathBuf },
    #[error("{stage}: a {kind} plugin cannot run as the {role}")]
    RoleMismatch {
        stage: String,
        kind: &'static str,
        role: StageRole,
    },
}
