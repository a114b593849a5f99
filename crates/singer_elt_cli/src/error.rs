use std::{io, path::PathBuf, process::ExitCode};

use singer_elt::{ConfigError, PipelineError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to write state to `{}`: {source}", .path.display())]
    StateOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode final state: {0}")]
    StateEncode(#[from] serde_json::Error),
}

impl Error {
    pub fn exit_code(&self) -> ExitCode {
        let code = match self {
            Error::Config(_) => 2,
            Error::Pipeline(PipelineError::Spawn { .. }) => 16,
            Error::Pipeline(PipelineError::Capture { .. }) => 15,
            Error::Pipeline(_) => 1,
            Error::StateOutput { .. } | Error::StateEncode(_) => 1,
        };
        ExitCode::from(code)
    }
}
