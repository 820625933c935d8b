// ws90_exporter - Prometheus metrics exporter for WS90 weather stations
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Longest line kept from the decoder. rtl_433 records are a few hundred bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// A single newline terminated chunk of decoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    /// Line with bytes that aren't UTF-8, with those bytes replaced.
    InvalidUtf8(String),
    /// Line longer than the maximum. Its contents were discarded.
    TooLong(usize),
}

/// Reads newline delimited lines without failing on invalid UTF-8 and without
/// buffering more than a maximum line length.
///
/// `next_line` may be used in `tokio::select!`. Partially read lines are kept
/// between calls so nothing is lost when another branch completes first.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_length: usize,
    discarded: Option<usize>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_length(inner, DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(inner: R, max_length: usize) -> Self {
        LineReader {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            max_length,
            discarded: None,
        }
    }

    /// Next non-empty line without its terminator, or `None` at the end of the
    /// stream. A final line without a trailing newline is still returned.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            let (used, complete) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok(self.finish());
                }

                let (chunk, used, complete) = match available.iter().position(|b| *b == b'\n') {
                    Some(i) => (&available[..i], i + 1, true),
                    None => (available, available.len(), false),
                };

                match self.discarded.as_mut() {
                    Some(n) => *n += chunk.len(),
                    None if self.buf.len() + chunk.len() > self.max_length => {
                        self.discarded = Some(self.buf.len() + chunk.len());
                        self.buf = Vec::new();
                    }
                    None => self.buf.extend_from_slice(chunk),
                }

                (used, complete)
            };

            self.reader.consume(used);
            if complete {
                if let Some(line) = self.finish() {
                    return Ok(Some(line));
                }
            }
        }
    }

    fn finish(&mut self) -> Option<Line> {
        if let Some(n) = self.discarded.take() {
            return Some(Line::TooLong(n));
        }

        if self.buf.is_empty() {
            return None;
        }

        let bytes = std::mem::take(&mut self.buf);
        Some(match String::from_utf8(bytes) {
            Ok(s) => Line::Text(s),
            Err(e) => Line::InvalidUtf8(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        })
    }
}
