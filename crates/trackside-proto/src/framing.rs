//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Newline framing for the serial byte stream."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---

/// Longest line accepted before the framer gives up on it.
pub const DEFAULT_MAX_LINE: usize = 1024;

/// Output of [`LineFramer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedLine {
    /// A complete line without its `\n` terminator.
    Line(Vec<u8>),
    /// A line exceeded the length cap and was dropped.
    Overflow {
        /// Bytes discarded before the framer resynchronised on a newline.
        discarded: usize,
    },
}

/// Buffers input across reads and emits a line whenever `\n` is seen.
///
/// `\r` is left in place; the codec strips it together with other
/// non-printable bytes. A line longer than the cap is dropped and the framer
/// skips everything up to the next newline.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line: usize,
    discarding: Option<usize>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineFramer {
    /// Create a framer with the given line cap (at least one byte).
    pub fn new(max_line: usize) -> Self {
        let max_line = max_line.max(1);
        Self {
            buffer: Vec::with_capacity(max_line.min(DEFAULT_MAX_LINE)),
            max_line,
            discarding: None,
        }
    }

    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<FramedLine> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if let Some(count) = self.discarding.as_mut() {
                *count += 1;
                if byte == b'\n' {
                    frames.push(FramedLine::Overflow { discarded: *count });
                    self.discarding = None;
                }
                continue;
            }
            if byte == b'\n' {
                frames.push(FramedLine::Line(std::mem::take(&mut self.buffer)));
                continue;
            }
            if self.buffer.len() >= self.max_line {
                self.discarding = Some(self.buffer.len() + 1);
                self.buffer.clear();
                continue;
            }
            self.buffer.push(byte);
        }
        frames
    }

    /// Bytes currently held for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = None;
    }
}
