//! Incremental framer for the feed's non-standard CSV dialect: fields are
//! separated by `|~~|`, rows by `|^^|`, there is no header row, and empty
//! trailing fields are significant. Standard CSV readers cannot express the
//! multi-character separators, so this is a small byte-level scanner with a
//! carry-over buffer for separator sequences split across reads.

use crate::errors::FramerError;

pub const FIELD_SEP: &[u8] = b"|~~|";
pub const ROW_SEP: &[u8] = b"|^^|";

/// Streaming row framer. Feed it chunks as they arrive from the object
/// store; it emits every completed row and carries the incomplete tail
/// (at most one row plus a partial separator) between pushes. The whole
/// object is never materialized.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    consumed: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, appending completed rows to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<Vec<String>>) -> Result<(), FramerError> {
        self.buf.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(at) = find(&self.buf[start..], ROW_SEP) {
            let row_end = start + at;
            out.push(split_row(&self.buf[start..row_end], self.consumed + start)?);
            start = row_end + ROW_SEP.len();
        }

        if start > 0 {
            self.buf.drain(..start);
            self.consumed += start;
        }
        Ok(())
    }

    /// Flush the final row, if the object did not end with a row separator.
    pub fn finish(self) -> Result<Option<Vec<String>>, FramerError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        split_row(&self.buf, self.consumed).map(Some)
    }
}

fn split_row(row: &[u8], offset: usize) -> Result<Vec<String>, FramerError> {
    let mut fields = Vec::new();
    let mut start = 0;
    loop {
        match find(&row[start..], FIELD_SEP) {
            Some(at) => {
                fields.push(decode(&row[start..start + at], offset)?);
                start += at + FIELD_SEP.len();
            }
            None => {
                fields.push(decode(&row[start..], offset)?);
                return Ok(fields);
            }
        }
    }
}

fn decode(bytes: &[u8], offset: usize) -> Result<String, FramerError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| FramerError::InvalidUtf8 { offset })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
