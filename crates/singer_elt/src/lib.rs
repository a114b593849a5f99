#![forbid(unsafe_code)]
//! Async runner for Singer Extract-Load pipelines.
//!
//! A run spawns a tap (extractor), an optional mapper and a target (loader) as subprocesses,
//! forwards the tap's newline-delimited JSON output through the chain, fans every stage's
//! stderr out to `tracing`, and derives a single [`RunOutcome`] from the exit codes and the
//! order in which the stages terminated.
//!
//! The record channel is treated as opaque bytes; only the per-line size limit derived from
//! [`BufferPolicy`] is enforced.

mod config;
mod context;
mod error;
mod forward;
mod log_mux;
mod outcome;
mod plugin;
mod process;
mod reader;
mod runner;
mod state;

pub use config::{PipelineConfig, PluginSection, StageSection};
pub use context::{
    BufferPolicy, CaptureTarget, EltContext, EltContextBuilder, OutputCapture, Stage,
    StageCommand, StageRole, StreamKind, DEFAULT_BUFFER_SIZE, DEFAULT_KILL_GRACE_PERIOD,
    MIN_BUFFER_SIZE,
};
pub use error::{ConfigError, DroppedSink, ForwardError, LogError, PipelineError};
pub use forward::{ForwardSummary, LineSink, SinkKind, StreamForwarder};
pub use log_mux::{LogMultiplexer, LogSummary};
pub use outcome::{RunOutcome, RunReport, StageExit, StageReport};
pub use plugin::{
    MapperInvocation, PluginInvocation, PluginKind, TapInvocation, TargetInvocation,
};
pub use process::{ProcessHandle, StdioConfig, StdioMode};
pub use runner::{PipelineRunner, RunPhase};
pub use state::parse_state_line;
