use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use singer_elt::{PipelineConfig, PipelineRunner};
use tracing::{info, warn};

use crate::error::Error;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Pipeline file.
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Overrides `buffer_size` from the pipeline file. Lines may be at most half of it.
    #[arg(long, env = "SINGER_ELT_BUFFER_SIZE", value_name = "BYTES")]
    pub buffer_size: Option<usize>,

    /// Write the last STATE value the loader acknowledged to this file.
    #[arg(long, value_name = "PATH")]
    pub state_output: Option<PathBuf>,
}

pub(crate) fn base_dir(config: &Path) -> &Path {
    config
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

pub async fn run(args: Args) -> Result<ExitCode, Error> {
    let mut config = PipelineConfig::load(&args.config)?;
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = Some(buffer_size);
    }
    let context = config.into_context(base_dir(&args.config))?;
    let runner = PipelineRunner::new(context);

    let report = runner
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {err}");
                std::future::pending::<()>().await;
            }
            info!("interrupted, stopping the pipeline");
        })
        .await?;

    if let Some(path) = &args.state_output {
        match &report.final_state {
            Some(state) => write_state(path, state).await?,
            None => info!("loader emitted no state, leaving {} untouched", path.display()),
        }
    }

    for stage in &report.stages {
        info!(
            plugin = %stage.name,
            role = %stage.role,
            code = stage.exit.effective_code(),
            terminated_by_pipeline = stage.terminated_by_pipeline,
            "stage summary"
        );
    }
    println!("{}", report.outcome);
    Ok(ExitCode::from(report.outcome.exit_code()))
}

async fn write_state(path: &Path, state: &serde_json::Value) -> Result<(), Error> {
    let mut encoded = serde_json::to_vec_pretty(state)?;
    encoded.push(b'\n');
    let io_err = |source| Error::StateOutput {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, encoded).await.map_err(io_err)?;
    info!(path = %path.display(), "final state written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_of_bare_file_is_cwd() {
        assert_eq!(base_dir(Path::new("pipeline.toml")), Path::new("."));
        assert_eq!(base_dir(Path::new("conf/pipeline.toml")), Path::new("conf"));
    }

    #[tokio::test]
    async fn state_is_written_pretty_with_parents() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("state/out.json");
        write_state(&path, &serde_json::json!({"bookmarks": {"users": 7}}))
            .await
            .expect("write state");
        let written = std::fs::read_to_string(&path).expect("read state");
        assert!(written.contains("\"users\": 7"), "{written}");
        assert!(written.ends_with('\n'));
    }
}
