use std::{fmt, io};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    error::DroppedSink,
    reader::{AsyncBoundedLineReader, BoundedLine},
    BufferPolicy, ForwardError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Stdin of a downstream stage.
    Stage,
    /// A tee for debugging or capture.
    Capture,
}

enum SinkTarget {
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    Channel(mpsc::UnboundedSender<Vec<u8>>),
}

/// A named destination for forwarded lines.
pub struct LineSink {
    name: String,
    kind: SinkKind,
    target: SinkTarget,
    flush_each_line: bool,
}

impl fmt::Debug for LineSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSink")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl LineSink {
    pub fn writer<W>(name: impl Into<String>, kind: SinkKind, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            kind,
            target: SinkTarget::Writer(Box::new(writer)),
            flush_each_line: false,
        }
    }

    /// Stdin of the next stage in the chain.
    pub fn stage<W>(name: impl Into<String>, stdin: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::writer(name, SinkKind::Stage, stdin)
    }

    /// Capture sink delivering one message per line. Fails once the receiver is dropped.
    pub fn channel(name: impl Into<String>, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            kind: SinkKind::Capture,
            target: SinkTarget::Channel(tx),
            flush_each_line: false,
        }
    }

    pub fn flush_each_line(mut self, enabled: bool) -> Self {
        self.flush_each_line = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub(crate) async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        match &mut self.target {
            SinkTarget::Writer(writer) => {
                writer.write_all(line).await?;
                if self.flush_each_line {
                    writer.flush().await?;
                }
                Ok(())
            }
            SinkTarget::Channel(tx) => tx
                .send(line.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped")),
        }
    }

    /// Flushes and shuts the sink down. For a stage sink this is the half-close of its stdin.
    pub(crate) async fn finish(mut self) -> io::Result<()> {
        if let SinkTarget::Writer(writer) = &mut self.target {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardSummary {
    pub lines: u64,
    pub bytes: u64,
    /// Sinks that failed while others kept receiving data.
    pub dropped: Vec<DroppedSink>,
}

/// Copies a line-delimited stream into an ordered list of sinks.
#[derive(Debug)]
pub struct StreamForwarder {
    label: String,
    policy: BufferPolicy,
    sinks: Vec<LineSink>,
}

impl StreamForwarder {
    pub fn new(label: impl Into<String>, policy: BufferPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            sinks: Vec::new(),
        }
    }

    pub fn sink(mut self, sink: LineSink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Runs until the source is exhausted, a line is too long, or every sink has failed.
    ///
    /// Sinks are closed when this returns, which is what lets a downstream stage observe
    /// end-of-input.
    pub async fn run<R>(self, source: R) -> Result<ForwardSummary, ForwardError>
    where
        R: AsyncRead + Unpin,
    {
        let StreamForwarder {
            label,
            policy,
            mut sinks,
        } = self;
        let had_sinks = !sinks.is_empty();
        let mut reader = AsyncBoundedLineReader::new(source, policy.max_line_bytes());
        let mut summary = ForwardSummary::default();

        loop {
            let line = match reader.next_line().await {
                Ok(BoundedLine::Line { bytes, .. }) => bytes,
                Ok(BoundedLine::Eof) => break,
                Ok(BoundedLine::LineTooLong {
                    line_number,
                    observed_bytes,
                    max_line_bytes,
                }) => {
                    warn!(
                        channel = %label,
                        line_number,
                        observed_bytes,
                        max_line_bytes,
                        "line exceeds limit, stopping"
                    );
                    close_sinks(&label, sinks, &mut summary).await;
                    return Err(ForwardError::LineTooLong {
                        limit: max_line_bytes,
                        buffer_size: policy.buffer_size,
                        observed: observed_bytes,
                    });
                }
                Err(err) => {
                    close_sinks(&label, sinks, &mut summary).await;
                    return Err(ForwardError::SourceRead(err));
                }
            };

            let mut idx = 0;
            while idx < sinks.len() {
                match sinks[idx].write_line(&line).await {
                    Ok(()) => idx += 1,
                    Err(err) => {
                        let sink = sinks.remove(idx);
                        debug!(channel = %label, sink = %sink.name, "dropping sink: {err}");
                        summary
                            .dropped
                            .push(DroppedSink::new(&sink.name, sink.kind, &err));
                    }
                }
            }

            summary.lines += 1;
            summary.bytes += line.len() as u64;

            if had_sinks && sinks.is_empty() {
                return Err(ForwardError::SinkFailure {
                    dropped: summary.dropped,
                });
            }
        }

        close_sinks(&label, sinks, &mut summary).await;
        debug!(
            channel = %label,
            lines = summary.lines,
            bytes = summary.bytes,
            "end of input"
        );
        Ok(summary)
    }
}

async fn close_sinks(label: &str, sinks: Vec<LineSink>, summary: &mut ForwardSummary) {
    for sink in sinks {
        let name = sink.name.clone();
        let kind = sink.kind;
        if let Err(err) = sink.finish().await {
            // A stage that already went away cannot observe the half-close anyway.
            if kind == SinkKind::Stage && err.kind() == io::ErrorKind::BrokenPipe {
                continue;
            }
            debug!(channel = %label, sink = %name, "closing sink failed: {err}");
            summary.dropped.push(DroppedSink::new(&name, kind, &err));
        }
    }
}
