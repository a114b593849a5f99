use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::{
    forward::LineSink,
    reader::{AsyncBoundedLineReader, BoundedLine},
    LogError, StageRole, StreamKind,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub lines: u64,
    /// Lines over the limit that were discarded instead of logged.
    pub truncated: u64,
}

/// Turns a stage's stderr (or stdout) into one `tracing` event per line and tees the raw
/// bytes into any extra sinks.
#[derive(Debug)]
pub struct LogMultiplexer {
    plugin: String,
    role: StageRole,
    stream: StreamKind,
    max_line_bytes: usize,
    sinks: Vec<LineSink>,
}

impl LogMultiplexer {
    pub fn new(plugin: impl Into<String>, role: StageRole, stream: StreamKind) -> Self {
        Self {
            plugin: plugin.into(),
            role,
            stream,
            max_line_bytes: crate::DEFAULT_BUFFER_SIZE / 2,
            sinks: Vec::new(),
        }
    }

    pub fn max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn sink(mut self, sink: LineSink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Reads `source` to the end. Sink failures are logged and the sink dropped; only a read
    /// error on `source` is returned.
    pub async fn run<R>(mut self, source: R) -> Result<LogSummary, LogError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = AsyncBoundedLineReader::new(source, self.max_line_bytes);
        let mut summary = LogSummary::default();

        loop {
            let next = match reader.next_line().await {
                Ok(next) => next,
                Err(source) => {
                    self.close().await;
                    return Err(LogError::SourceRead {
                        plugin: self.plugin,
                        stream: self.stream,
                        source,
                    });
                }
            };

            match next {
                BoundedLine::Eof => break,
                BoundedLine::Line { bytes, .. } => {
                    summary.lines += 1;
                    self.emit(&String::from_utf8_lossy(trim_newline(&bytes)));
                    self.tee(&bytes).await;
                }
                BoundedLine::LineTooLong { observed_bytes, .. } => {
                    summary.truncated += 1;
                    warn!(
                        plugin = %self.plugin,
                        role = %self.role,
                        stream = %self.stream,
                        observed_bytes,
                        "discarding oversized log line"
                    );
                    if let Err(source) = reader.skip_line().await {
                        self.close().await;
                        return Err(LogError::SourceRead {
                            plugin: self.plugin,
                            stream: self.stream,
                            source,
                        });
                    }
                }
            }
        }

        self.close().await;
        Ok(summary)
    }

    fn emit(&self, message: &str) {
        let (plugin, role, stream) = (&self.plugin, self.role, self.stream);
        match stream {
            StreamKind::Stderr => info!(%plugin, %role, %stream, "{message}"),
            StreamKind::Stdout => debug!(%plugin, %role, %stream, "{message}"),
        }
    }

    async fn tee(&mut self, bytes: &[u8]) {
        let mut idx = 0;
        while idx < self.sinks.len() {
            match self.sinks[idx].write_line(bytes).await {
                Ok(()) => idx += 1,
                Err(err) => {
                    let sink = self.sinks.remove(idx);
                    warn!(
                        plugin = %self.plugin,
                        stream = %self.stream,
                        sink = %sink.name(),
                        "log sink failed, dropping it: {err}"
                    );
                }
            }
        }
    }

    async fn close(&mut self) {
        for sink in self.sinks.drain(..) {
            let name = sink.name().to_string();
            if let Err(err) = sink.finish().await {
                warn!(plugin = %self.plugin, sink = %name, "closing log sink failed: {err}");
            }
        }
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}
