//! Chunked command stream: staging writer and incremental reassembly.
//!
//! The transport contract is an ordered, reliable byte stream with a
//! caller-imposed maximum write-chunk size; no framing exists beyond the
//! command layout in [`crate::command`]. One command may span many physical
//! chunks and one chunk may carry many commands. The parser accepts arbitrary
//! chunk boundaries and never buffers more than one command's declared
//! trailing length.

use crate::command::fixed_len;
use crate::error::WireError;

/// Default cap on a single command's trailing payload.
pub const DEFAULT_MAX_TRAILING_LEN: usize = 16 * 1024 * 1024;

/// Default transport write-chunk size.
pub const DEFAULT_MAX_WRITE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_trailing_len: usize,
    pub max_write_chunk: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_trailing_len: DEFAULT_MAX_TRAILING_LEN,
            max_write_chunk: DEFAULT_MAX_WRITE_CHUNK,
        }
    }
}

/// Receives transport-sized chunks from [`CommandWriter::flush`].
pub trait CommandSink {
    fn write_chunk(&mut self, chunk: &[u8]);
}

/// Collects chunks for tests and in-process loopback transports.
impl CommandSink for Vec<Vec<u8>> {
    fn write_chunk(&mut self, chunk: &[u8]) {
        self.push(chunk.to_vec());
    }
}

/// Staging buffer for outgoing commands. Commands accumulate encoded and are
/// pushed to the transport in `max_write_chunk` slices on flush.
#[derive(Debug)]
pub struct CommandWriter {
    staged: Vec<u8>,
    max_write_chunk: usize,
}

impl CommandWriter {
    pub fn new(limits: &Limits) -> Self {
        Self {
            staged: Vec::new(),
            max_write_chunk: limits.max_write_chunk.max(1),
        }
    }

    pub fn staged_bytes(&self) -> usize {
        self.staged.len()
    }

    /// Appends pre-encoded command bytes to the staging buffer.
    pub fn push_encoded(&mut self, f: impl FnOnce(&mut Vec<u8>)) {
        f(&mut self.staged);
    }

    /// Drains everything staged so far into the sink, split across
    /// transport-size chunks. Chunk boundaries carry no meaning.
    pub fn flush(&mut self, sink: &mut dyn CommandSink) {
        let mut rest = self.staged.as_slice();
        while !rest.is_empty() {
            let take = rest.len().min(self.max_write_chunk);
            sink.write_chunk(&rest[..take]);
            rest = &rest[take..];
        }
        self.staged.clear();
    }
}

/// One reassembled command, still in byte form. `fixed` is exactly
/// `fixed_len(tag)` bytes; `trailing` is exactly the declared trailing
/// length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub tag: u32,
    pub fixed: Vec<u8>,
    pub trailing: Vec<u8>,
}

#[derive(Debug)]
enum ParserState {
    Tag {
        buf: [u8; 4],
        filled: usize,
    },
    Fixed {
        tag: u32,
        need: usize,
        buf: Vec<u8>,
    },
    TrailerLen {
        tag: u32,
        fixed: Vec<u8>,
        buf: [u8; 4],
        filled: usize,
    },
    Trailer {
        tag: u32,
        fixed: Vec<u8>,
        need: usize,
        buf: Vec<u8>,
    },
}

impl ParserState {
    fn start() -> Self {
        ParserState::Tag {
            buf: [0; 4],
            filled: 0,
        }
    }
}

/// Incremental reassembly of wire commands from transport chunks.
///
/// The tag is validated before any fixed bytes are buffered, and the trailing
/// length is validated against [`Limits::max_trailing_len`] before any
/// trailing bytes are buffered, so a malicious stream can never make the
/// parser allocate more than one bounded command.
#[derive(Debug)]
pub struct WireParser {
    max_trailing_len: usize,
    state: ParserState,
}

impl WireParser {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_trailing_len: limits.max_trailing_len,
            state: ParserState::start(),
        }
    }

    /// Feeds one transport chunk, returning every command it completes.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<Vec<WireFrame>, WireError> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            match &mut self.state {
                ParserState::Tag { buf, filled } => {
                    let take = (4 - *filled).min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];
                    if *filled < 4 {
                        continue;
                    }

                    let tag = u32::from_le_bytes(*buf);
                    let need = fixed_len(tag)?;
                    self.state = ParserState::Fixed {
                        tag,
                        need,
                        buf: Vec::with_capacity(need),
                    };
                }
                ParserState::Fixed { tag, need, buf } => {
                    let take = (*need - buf.len()).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if buf.len() < *need {
                        continue;
                    }

                    let tag = *tag;
                    let fixed = std::mem::take(buf);
                    self.state = ParserState::TrailerLen {
                        tag,
                        fixed,
                        buf: [0; 4],
                        filled: 0,
                    };
                }
                ParserState::TrailerLen {
                    tag,
                    fixed,
                    buf,
                    filled,
                } => {
                    let take = (4 - *filled).min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];
                    if *filled < 4 {
                        continue;
                    }

                    let tag = *tag;
                    let len = u32::from_le_bytes(*buf) as usize;
                    if len > self.max_trailing_len {
                        return Err(WireError::OversizedTrailer {
                            tag,
                            len,
                            max: self.max_trailing_len,
                        });
                    }
                    let fixed = std::mem::take(fixed);
                    if len == 0 {
                        frames.push(WireFrame {
                            tag,
                            fixed,
                            trailing: Vec::new(),
                        });
                        self.state = ParserState::start();
                        continue;
                    }
                    self.state = ParserState::Trailer {
                        tag,
                        fixed,
                        need: len,
                        buf: Vec::with_capacity(len),
                    };
                }
                ParserState::Trailer {
                    tag,
                    fixed,
                    need,
                    buf,
                } => {
                    let take = (*need - buf.len()).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if buf.len() < *need {
                        continue;
                    }

                    frames.push(WireFrame {
                        tag: *tag,
                        fixed: std::mem::take(fixed),
                        trailing: std::mem::take(buf),
                    });
                    self.state = ParserState::start();
                }
            }
        }

        Ok(frames)
    }

    /// Verifies the stream ended on a command boundary.
    pub fn finish(&self) -> Result<(), WireError> {
        let pending = match &self.state {
            ParserState::Tag { filled, .. } => *filled,
            ParserState::Fixed { buf, .. } => 4 + buf.len(),
            ParserState::TrailerLen { fixed, filled, .. } => 4 + fixed.len() + *filled,
            ParserState::Trailer { fixed, buf, .. } => 4 + fixed.len() + 4 + buf.len(),
        };
        if pending == 0 {
            Ok(())
        } else {
            Err(WireError::TruncatedStream { pending })
        }
    }
}
