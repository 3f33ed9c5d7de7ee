//! Delimiter-framed record extraction on top of [`ByteBuffer`].

use serde::{Deserialize, Serialize};

use crate::{
    buffer::ByteBuffer,
    error::{NetError, Result},
};

pub const LF: u8 = b'\n';
pub const CR: u8 = b'\r';

/// Default bound for a single line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 32 * 1024;

/// What to do when a line outgrows its bound before a delimiter shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinePolicy {
    /// Fail with [`NetError::LineTooLong`], leaving the buffer untouched.
    Reject,
    /// Hand out exactly `max_len` bytes as a partial record.
    #[default]
    Split,
}

/// An extracted record, delimiter stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Complete(Vec<u8>),
    /// A forced split; the rest of the record follows in later calls.
    Partial(Vec<u8>),
}

impl Line {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Line::Complete(bytes) | Line::Partial(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Line::Complete(bytes) | Line::Partial(bytes) => bytes,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Line::Partial(_))
    }
}

/// Scans `buffer` for one `delimiter`-terminated record.
///
/// Returns `Ok(None)` when more data is needed. A `max_len` of `0` disables
/// the bound.
pub fn try_extract_line(
    buffer: &mut ByteBuffer,
    delimiter: u8,
    max_len: usize,
    policy: LinePolicy,
) -> Result<Option<Line>> {
    LineReader::new(delimiter, max_len, policy).try_extract_line(buffer)
}

/// Stateful line extractor that remembers how far it already scanned.
///
/// The reader must be the only consumer of the buffer it is used with;
/// otherwise the remembered offset may point past unseen bytes.
#[derive(Debug, Clone)]
pub struct LineReader {
    delimiter: u8,
    max_len: usize,
    policy: LinePolicy,
    scanned: usize,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new(LF, DEFAULT_MAX_LINE_LENGTH, LinePolicy::default())
    }
}

impl LineReader {
    pub fn new(delimiter: u8, max_len: usize, policy: LinePolicy) -> Self {
        Self {
            delimiter,
            max_len,
            policy,
            scanned: 0,
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn policy(&self) -> LinePolicy {
        self.policy
    }

    pub fn try_extract_line(&mut self, buffer: &mut ByteBuffer) -> Result<Option<Line>> {
        if self.scanned > buffer.size() {
            self.scanned = 0;
        }

        match buffer.find(self.delimiter, self.scanned) {
            Some(pos) if self.bounded() && pos > self.max_len => self.overflow(buffer),
            Some(pos) => {
                self.scanned = 0;
                let mut line = buffer.extract_vec(pos + 1)?;
                line.pop();
                if self.delimiter == LF && line.last() == Some(&CR) {
                    line.pop();
                }
                Ok(Some(Line::Complete(line)))
            }
            None => {
                self.scanned = buffer.size();
                if self.bounded() && buffer.size() > self.max_len {
                    self.overflow(buffer)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn bounded(&self) -> bool {
        self.max_len != 0
    }

    fn overflow(&mut self, buffer: &mut ByteBuffer) -> Result<Option<Line>> {
        match self.policy {
            LinePolicy::Reject => Err(NetError::LineTooLong {
                max_len: self.max_len,
            }),
            LinePolicy::Split => {
                self.scanned = 0;
                Ok(Some(Line::Partial(buffer.extract_vec(self.max_len)?)))
            }
        }
    }
}
