//! Lenient newline-delimited JSON decoding for streamed generate responses.
//!
//! Each line is decoded on its own. Blank lines and lines that are not a
//! generate record are skipped; they never end the stream.

use crate::{Error, GenerateChunk};
use futures::{Stream, StreamExt};
use std::fmt::Display;

/// Incremental line splitter that keeps partial lines between transport chunks.
///
/// Bytes are buffered rather than text so a multi-byte character split across
/// two chunks is decoded once the whole line is available.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed transport bytes and return the records from every completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<GenerateChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(chunk) = decode_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Decode whatever is left once the source has closed.
    pub fn finish(&mut self) -> Option<GenerateChunk> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Number of buffered bytes still waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one line, returning `None` for blank or malformed input.
pub fn decode_line(line: &[u8]) -> Option<GenerateChunk> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<GenerateChunk>(trimmed) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            tracing::debug!(error = %e, line = %trimmed, "skipping malformed stream line");
            None
        }
    }
}

/// Turn a byte stream into a stream of generate records.
///
/// Transport errors are forwarded as `Error::Network`; the stream ends when
/// the source ends, after flushing an unterminated final line.
pub fn decode_ndjson<S, B, E>(source: S) -> impl Stream<Item = Result<GenerateChunk, Error>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    // A trailing `None` marks end-of-source so the decoder can flush.
    source
        .map(Some)
        .chain(futures::stream::once(futures::future::ready(None)))
        .scan(LineDecoder::new(), |decoder, item| {
            let records: Vec<Result<GenerateChunk, Error>> = match item {
                Some(Ok(bytes)) => decoder.push(bytes.as_ref()).into_iter().map(Ok).collect(),
                Some(Err(e)) => vec![Err(Error::Network(e.to_string()))],
                None => decoder.finish().into_iter().map(Ok).collect(),
            };
            futures::future::ready(Some(records))
        })
        .flat_map(futures::stream::iter)
}
