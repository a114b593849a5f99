use std::{path::PathBuf, process::ExitCode};

use singer_elt::PipelineConfig;

use crate::{error::Error, run::base_dir};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Pipeline file.
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,
}

pub fn run(args: Args) -> Result<ExitCode, Error> {
    let config = PipelineConfig::load(&args.config)?;
    let context = config.into_context(base_dir(&args.config))?;

    println!(
        "buffer size: {} bytes (line limit {} bytes)",
        context.buffer.buffer_size,
        context.buffer.max_line_bytes()
    );
    println!("kill grace period: {:?}", context.kill_grace_period);
    for stage in context.stages() {
        println!(
            "{:<9} {}: {}",
            stage.role().as_str(),
            stage.name(),
            stage.command.display_command()
        );
    }
    Ok(ExitCode::SUCCESS)
}
