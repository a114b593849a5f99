use std::{collections::BTreeSet, future::Future, process::ExitStatus, time::Duration};

use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle, JoinSet},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    forward::{ForwardSummary, LineSink, SinkKind, StreamForwarder},
    log_mux::{LogMultiplexer, LogSummary},
    outcome::{derive_outcome, RunFacts},
    process::{ProcessHandle, StdioConfig},
    state::collect_final_state,
    EltContext, ForwardError, LogError, PipelineError, RunOutcome, RunReport, Stage, StageExit,
    StageReport, StageRole, StreamKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Spawning,
    Streaming,
    Draining,
    Finished,
}

/// Runs one extractor → (mapper →) loader pipeline per call to [`PipelineRunner::run`].
#[derive(Debug)]
pub struct PipelineRunner {
    context: EltContext,
    phase: watch::Sender<RunPhase>,
}

/// Result of one record forwarder, tagged with the stage that produced the stream.
struct RecordDone {
    role: StageRole,
    stage: String,
    result: Result<ForwardSummary, ForwardError>,
}

/// Why streaming stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    UpstreamFinished,
    LoaderFirst,
    RecordFailure,
    Aborted,
}

impl PipelineRunner {
    pub fn new(context: EltContext) -> Self {
        let (phase, _) = watch::channel(RunPhase::NotStarted);
        Self { context, phase }
    }

    pub fn context(&self) -> &EltContext {
        &self.context
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    /// Receives every phase transition of subsequent runs.
    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Runs the pipeline to completion.
    ///
    /// `Err` is reserved for runs that never got going (a stage failed to spawn) or lost track
    /// of a process; every other result, including stage failures, is a [`RunReport`].
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`PipelineRunner::run`], but kills every stage once `abort` completes.
    pub async fn run_until<F>(&self, abort: F) -> Result<RunReport, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let result = self.execute(abort).await;
        self.set_phase(RunPhase::Finished);
        if let Ok(report) = &result {
            info!(outcome = %report.outcome, "pipeline finished");
        }
        result
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!(?phase, "pipeline phase");
        self.phase.send_replace(phase);
    }

    async fn execute<F>(&self, abort: F) -> Result<RunReport, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let ctx = &self.context;
        let grace = ctx.kill_grace_period;
        tokio::pin!(abort);

        let mut sinks = StageSinks::open_all(ctx).await?;

        self.set_phase(RunPhase::Spawning);
        let mut extractor =
            ProcessHandle::spawn(&ctx.extractor.command, StdioConfig::producer()).await?;
        let mut mapper = match &ctx.mapper {
            Some(stage) => match ProcessHandle::spawn(&stage.command, StdioConfig::piped()).await {
                Ok(handle) => Some(handle),
                Err(err) => {
                    release(&mut [&mut extractor], grace).await;
                    return Err(err);
                }
            },
            None => None,
        };
        let mut loader = match ProcessHandle::spawn(&ctx.loader.command, StdioConfig::piped()).await
        {
            Ok(handle) => handle,
            Err(err) => {
                let mut spawned = vec![&mut extractor];
                spawned.extend(mapper.as_mut());
                release(&mut spawned, grace).await;
                return Err(err);
            }
        };

        let mut tasks = match wire(ctx, &mut sinks, &mut extractor, mapper.as_mut(), &mut loader) {
            Ok(tasks) => tasks,
            Err(err) => {
                let mut spawned = vec![&mut extractor];
                spawned.extend(mapper.as_mut());
                spawned.push(&mut loader);
                release(&mut spawned, grace).await;
                return Err(err);
            }
        };

        self.set_phase(RunPhase::Streaming);
        let mut run = RunState::new(&tasks);

        let terminal = loop {
            if run.record_failed {
                break Terminal::RecordFailure;
            }
            if let Some(role) = run.orphaned.pop_first() {
                // Nothing this stage or anything upstream of it writes can be delivered anymore.
                warn!(%role, "downstream of the {role} stopped reading, stopping upstream stages");
                if role == StageRole::Mapper {
                    if let Some(mapper) = mapper.as_mut() {
                        run.stop(mapper, grace).await?;
                    }
                }
                run.stop(&mut extractor, grace).await?;
                continue;
            }
            let upstream_done =
                extractor.has_exited() && mapper.as_ref().map_or(true, ProcessHandle::has_exited);
            if upstream_done {
                break Terminal::UpstreamFinished;
            }
            if loader.has_exited() || mapper.as_ref().is_some_and(ProcessHandle::has_exited) {
                // Forwarders that already hit end-of-input do not count as pending output.
                while let Some(joined) = tasks.records.try_join_next() {
                    run.on_record_done(joined);
                }
                if run.record_failed {
                    continue;
                }
            }
            if loader.has_exited() && !run.open_records.is_empty() {
                break Terminal::LoaderFirst;
            }
            if let Some(mapper) = mapper.as_ref() {
                if mapper.has_exited()
                    && !extractor.has_exited()
                    && run.open_records.contains(&StageRole::Extractor)
                {
                    warn!(
                        plugin = %extractor.name(),
                        "mapper exited while the extractor was still producing output"
                    );
                    run.stop(&mut extractor, grace).await?;
                    continue;
                }
            }

            let mapper_pending = mapper.as_ref().is_some_and(|m| !m.has_exited());
            tokio::select! {
                biased;
                _ = &mut abort, if !run.facts.aborted => {
                    run.facts.aborted = true;
                    break Terminal::Aborted;
                }
                status = extractor.wait(), if !extractor.has_exited() => {
                    status?;
                }
                status = wait_optional(mapper.as_mut()), if mapper_pending => {
                    status?;
                }
                status = loader.wait(), if !loader.has_exited() => {
                    status?;
                }
                Some(joined) = tasks.records.join_next(), if !tasks.records.is_empty() => {
                    run.on_record_done(joined);
                }
            }
        };

        self.set_phase(RunPhase::Draining);
        info!(?terminal, "streaming stopped");

        match terminal {
            Terminal::UpstreamFinished => {
                while !tasks.records.is_empty() {
                    tokio::select! {
                        biased;
                        Some(joined) = tasks.records.join_next() => run.on_record_done(joined),
                        _ = &mut abort, if !run.facts.aborted => {
                            run.facts.aborted = true;
                            loader.kill(grace).await?;
                            tasks.records.abort_all();
                        }
                        else => break,
                    }
                }
            }
            Terminal::LoaderFirst | Terminal::RecordFailure => {
                if let Some(mapper) = mapper.as_mut() {
                    run.stop(mapper, grace).await?;
                }
                run.stop(&mut extractor, grace).await?;
                tasks.records.abort_all();
            }
            Terminal::Aborted => {
                extractor.kill(grace).await?;
                if let Some(mapper) = mapper.as_mut() {
                    mapper.kill(grace).await?;
                }
                loader.kill(grace).await?;
                tasks.records.abort_all();
            }
        }
        while let Some(joined) = tasks.records.join_next().await {
            run.on_record_done(joined);
        }

        // Every forwarder into the loader is gone, so its stdin is closed and it sees
        // end-of-input.
        if !loader.has_exited() {
            tokio::select! {
                biased;
                status = loader.wait() => {
                    status?;
                }
                _ = &mut abort, if !run.facts.aborted => {
                    run.facts.aborted = true;
                    loader.kill(grace).await?;
                }
            }
        }

        let mut stages = vec![run.report(&mut extractor).await?];
        if let Some(mapper) = mapper.as_mut() {
            stages.push(run.report(mapper).await?);
        }
        stages.push(run.report(&mut loader).await?);

        // Every stage is reaped. Whatever still holds a log pipe open is an orphaned
        // grandchild, so the log tasks only get the grace period to finish.
        let drained = time::timeout(grace, async {
            while let Some(joined) = tasks.logs.join_next().await {
                run.on_log_done(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                pending = tasks.logs.len(),
                "log streams still open after every stage exited, cancelling them"
            );
            tasks.logs.abort_all();
            while let Some(joined) = tasks.logs.join_next().await {
                run.on_log_done(joined);
            }
        }
        let final_state = match tasks.state.await {
            Ok(state) => state,
            Err(err) => {
                warn!("state tracker failed: {err}");
                None
            }
        };

        let RunState {
            facts,
            records_forwarded,
            ..
        } = run;
        let outcome = derive_outcome(&stages, facts);
        Ok(RunReport {
            outcome,
            stages,
            final_state,
            records_forwarded,
        })
    }
}

/// Per-run bookkeeping owned by the supervising task.
struct RunState {
    facts: RunFacts,
    records_forwarded: u64,
    record_failed: bool,
    /// Source roles whose record forwarder is still running.
    open_records: BTreeSet<StageRole>,
    /// Stages the pipeline stopped; their exit codes do not count.
    released: BTreeSet<StageRole>,
    /// Producers whose consumer stopped reading and that have not been stopped yet.
    orphaned: BTreeSet<StageRole>,
}

impl RunState {
    fn new(tasks: &Tasks) -> Self {
        Self {
            facts: RunFacts::default(),
            records_forwarded: 0,
            record_failed: false,
            open_records: tasks.record_sources.clone(),
            released: BTreeSet::new(),
            orphaned: BTreeSet::new(),
        }
    }

    /// Kills a stage on the pipeline's behalf. A stage that already exited keeps its own code.
    async fn stop(
        &mut self,
        handle: &mut ProcessHandle,
        grace: Duration,
    ) -> Result<(), PipelineError> {
        if !handle.has_exited() {
            self.released.insert(handle.role());
        }
        handle.kill(grace).await?;
        Ok(())
    }

    fn downstream_closed(&mut self, role: StageRole, channel: &str) {
        info!(%channel, "downstream stage stopped reading");
        self.released.insert(role);
        self.orphaned.insert(role);
    }

    fn on_record_done(&mut self, joined: Result<RecordDone, JoinError>) {
        let RecordDone {
            role,
            stage,
            result,
        } = match joined {
            Ok(done) => done,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                warn!("record forwarder panicked: {err}");
                self.record_failed = true;
                self.facts.plumbing.get_or_insert(RunOutcome::SinkFailure {
                    channel: "record forwarder".to_string(),
                    message: err.to_string(),
                });
                return;
            }
        };
        self.open_records.remove(&role);
        let channel = format!("{stage} stdout");

        match result {
            Ok(summary) => {
                if role == StageRole::Extractor {
                    self.records_forwarded = summary.lines;
                }
                if summary
                    .dropped
                    .iter()
                    .any(|sink| sink.kind == SinkKind::Stage)
                {
                    self.downstream_closed(role, &channel);
                }
                let capture = summary
                    .dropped
                    .iter()
                    .find(|sink| sink.kind == SinkKind::Capture);
                if let Some(dropped) = capture {
                    warn!(
                        %channel,
                        sink = %dropped.name,
                        "capture sink failed: {}",
                        dropped.message
                    );
                    self.facts
                        .plumbing
                        .get_or_insert_with(|| RunOutcome::SinkFailure {
                            channel: channel.clone(),
                            message: format!("{}: {}", dropped.name, dropped.message),
                        });
                }
            }
            Err(err) if err.downstream_closed() => self.downstream_closed(role, &channel),
            Err(ForwardError::LineTooLong {
                limit, buffer_size, ..
            }) => {
                warn!(%channel, limit, buffer_size, "output line limit exceeded");
                self.record_failed = true;
                self.facts
                    .line_limit
                    .get_or_insert_with(|| RunOutcome::OutputLineLimitExceeded {
                        stage,
                        role,
                        limit,
                        buffer_size,
                    });
            }
            Err(err) => {
                warn!(%channel, "record forwarding failed: {err}");
                self.record_failed = true;
                self.facts.plumbing.get_or_insert(RunOutcome::SinkFailure {
                    channel,
                    message: err.to_string(),
                });
            }
        }
    }

    fn on_log_done(&mut self, joined: Result<Result<LogSummary, LogError>, JoinError>) {
        match joined {
            Ok(Ok(summary)) => debug!(lines = summary.lines, "log stream drained"),
            Ok(Err(err)) => {
                warn!("{err}");
                let LogError::SourceRead { plugin, stream, .. } = &err;
                let channel = format!("{plugin} {stream}");
                self.facts.plumbing.get_or_insert(RunOutcome::SinkFailure {
                    channel,
                    message: err.to_string(),
                });
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => warn!("log task panicked: {err}"),
        }
    }

    async fn report(&self, handle: &mut ProcessHandle) -> Result<StageReport, PipelineError> {
        let status: ExitStatus = handle.wait().await?;
        Ok(StageReport {
            name: handle.name().to_string(),
            role: handle.role(),
            exit: StageExit::from_status(status),
            terminated_by_pipeline: handle.was_killed()
                || self.released.contains(&handle.role()),
        })
    }
}

/// Background tasks of one run.
struct Tasks {
    records: JoinSet<RecordDone>,
    record_sources: BTreeSet<StageRole>,
    logs: JoinSet<Result<LogSummary, LogError>>,
    state: JoinHandle<Option<Value>>,
}

/// Capture sinks opened before anything is spawned, so a bad path fails the run up front.
#[derive(Default)]
struct StageSinks {
    stdout: Option<LineSink>,
    stderr: Option<LineSink>,
}

impl StageSinks {
    async fn open(stage: &Stage) -> Result<Self, PipelineError> {
        let name = stage.name();
        let stdout = match &stage.capture.stdout {
            Some(target) => Some(target.open(format!("{name} stdout capture")).await?),
            None => None,
        };
        let stderr = match &stage.capture.stderr {
            Some(target) => Some(target.open(format!("{name} stderr capture")).await?),
            None => None,
        };
        Ok(Self { stdout, stderr })
    }

    async fn open_all(ctx: &EltContext) -> Result<[StageSinks; 3], PipelineError> {
        let mapper = match &ctx.mapper {
            Some(stage) => StageSinks::open(stage).await?,
            None => StageSinks::default(),
        };
        Ok([
            StageSinks::open(&ctx.extractor).await?,
            mapper,
            StageSinks::open(&ctx.loader).await?,
        ])
    }
}

fn wire(
    ctx: &EltContext,
    sinks: &mut [StageSinks; 3],
    extractor: &mut ProcessHandle,
    mapper: Option<&mut ProcessHandle>,
    loader: &mut ProcessHandle,
) -> Result<Tasks, PipelineError> {
    let policy = ctx.buffer;
    let [extractor_sinks, mapper_sinks, loader_sinks] = sinks;
    let mut records = JoinSet::new();
    let mut record_sources = BTreeSet::new();
    let mut logs = JoinSet::new();

    let loader_stdin = LineSink::stage(format!("{} stdin", loader.name()), loader.take_stdin()?);
    let max_line_bytes = policy.max_line_bytes();

    let extractor_out = extractor.take_stdout()?;
    let extractor_target = match mapper {
        Some(mapper) => {
            let mapper_stdin =
                LineSink::stage(format!("{} stdin", mapper.name()), mapper.take_stdin()?);
            let mut forwarder = StreamForwarder::new(format!("{} stdout", mapper.name()), policy)
                .sink(loader_stdin);
            if let Some(capture) = mapper_sinks.stdout.take() {
                forwarder = forwarder.sink(capture);
            }
            let mapper_out = mapper.take_stdout()?;
            let stage = mapper.name().to_string();
            records.spawn(async move {
                RecordDone {
                    role: StageRole::Mapper,
                    stage,
                    result: forwarder.run(mapper_out).await,
                }
            });
            record_sources.insert(StageRole::Mapper);

            let capture = mapper_sinks.stderr.take();
            spawn_log(&mut logs, mapper, StreamKind::Stderr, max_line_bytes, capture)?;
            mapper_stdin
        }
        None => loader_stdin,
    };

    let mut forwarder = StreamForwarder::new(format!("{} stdout", extractor.name()), policy)
        .sink(extractor_target);
    if let Some(capture) = extractor_sinks.stdout.take() {
        forwarder = forwarder.sink(capture);
    }
    let stage = extractor.name().to_string();
    records.spawn(async move {
        RecordDone {
            role: StageRole::Extractor,
            stage,
            result: forwarder.run(extractor_out).await,
        }
    });
    record_sources.insert(StageRole::Extractor);

    let capture = extractor_sinks.stderr.take();
    spawn_log(&mut logs, extractor, StreamKind::Stderr, max_line_bytes, capture)?;
    let capture = loader_sinks.stderr.take();
    spawn_log(&mut logs, loader, StreamKind::Stderr, max_line_bytes, capture)?;

    // The loader's stdout is always drained; STATE acknowledgements are tracked on the way.
    let (state_tx, state_rx) = mpsc::unbounded_channel();
    let mut loader_out = LogMultiplexer::new(loader.name(), StageRole::Loader, StreamKind::Stdout)
        .max_line_bytes(max_line_bytes)
        .sink(LineSink::channel("state tracker", state_tx));
    if let Some(capture) = loader_sinks.stdout.take() {
        loader_out = loader_out.sink(capture);
    }
    let loader_stdout = loader.take_stdout()?;
    logs.spawn(loader_out.run(loader_stdout));
    let state = tokio::spawn(collect_final_state(state_rx));

    Ok(Tasks {
        records,
        record_sources,
        logs,
        state,
    })
}

fn spawn_log(
    logs: &mut JoinSet<Result<LogSummary, LogError>>,
    handle: &mut ProcessHandle,
    stream: StreamKind,
    max_line_bytes: usize,
    capture: Option<LineSink>,
) -> Result<(), PipelineError> {
    let mut mux =
        LogMultiplexer::new(handle.name(), handle.role(), stream).max_line_bytes(max_line_bytes);
    if let Some(capture) = capture {
        mux = mux.sink(capture);
    }
    let stderr = handle.take_stderr()?;
    logs.spawn(mux.run(stderr));
    Ok(())
}

async fn wait_optional(handle: Option<&mut ProcessHandle>) -> Result<ExitStatus, PipelineError> {
    match handle {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}

/// Kills and reaps stages that were spawned before a later step of the run failed.
async fn release(handles: &mut [&mut ProcessHandle], grace: Duration) {
    for handle in handles.iter_mut() {
        if let Err(err) = handle.kill(grace).await {
            warn!(plugin = %handle.name(), "failed to release stage: {err}");
        }
    }
}
