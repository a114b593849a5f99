use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const CHUNK_SIZE_BYTES: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BoundedLine {
    /// A complete line including its `\n`, or the unterminated tail of the stream.
    Line { line_number: usize, bytes: Vec<u8> },
    /// The current line grew past the limit. Nothing after the offending chunk is consumed.
    LineTooLong {
        line_number: usize,
        observed_bytes: usize,
        max_line_bytes: usize,
    },
    Eof,
}

/// Line reader that never holds more than `max_line_bytes` of a single line in memory.
pub(crate) struct AsyncBoundedLineReader<R> {
    reader: BufReader<R>,
    max_line_bytes: usize,
    line_number: usize,
}

impl<R: AsyncRead + Unpin> AsyncBoundedLineReader<R> {
    pub(crate) fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE_BYTES, reader),
            max_line_bytes,
            line_number: 0,
        }
    }

    pub(crate) async fn next_line(&mut self) -> io::Result<BoundedLine> {
        let mut current = Vec::new();
        loop {
            let (consumed, complete) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    if current.is_empty() {
                        return Ok(BoundedLine::Eof);
                    }
                    return Ok(self.finish_line(current));
                }

                let (take, complete) = match available.iter().position(|b| *b == b'\n') {
                    Some(idx) => (idx + 1, true),
                    None => (available.len(), false),
                };
                let content_bytes = current.len() + take - usize::from(complete);
                if content_bytes > self.max_line_bytes {
                    self.line_number += 1;
                    return Ok(BoundedLine::LineTooLong {
                        line_number: self.line_number,
                        observed_bytes: content_bytes,
                        max_line_bytes: self.max_line_bytes,
                    });
                }
                current.extend_from_slice(&available[..take]);
                (take, complete)
            };
            self.reader.consume(consumed);
            if complete {
                return Ok(self.finish_line(current));
            }
        }
    }

    /// Discards input up to and including the next `\n`. Returns the bytes skipped.
    pub(crate) async fn skip_line(&mut self) -> io::Result<usize> {
        let mut skipped = 0;
        loop {
            let (consumed, complete) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok(skipped);
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(idx) => (idx + 1, true),
                    None => (available.len(), false),
                }
            };
            self.reader.consume(consumed);
            skipped += consumed;
            if complete {
                return Ok(skipped);
            }
        }
    }

    fn finish_line(&mut self, bytes: Vec<u8>) -> BoundedLine {
        self.line_number += 1;
        BoundedLine::Line {
            line_number: self.line_number,
            bytes,
        }
    }
}
