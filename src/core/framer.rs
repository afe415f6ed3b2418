//! # CoT Message Framer
//!
//! Splits a byte stream into complete `<event>` documents.
//!
//! CoT servers write events back to back with no length prefix and often no
//! newline, so message boundaries are found by scanning for the event
//! envelope. An optional `<?xml ...?>` declaration directly in front of an
//! event is kept with it.
//!
//! ## Guarantees
//! - fragments split across reads are retained until the rest arrives
//! - bytes that do not belong to an event envelope are discarded, never fatal
//! - an unterminated event followed by a new `<event` is dropped as malformed
//! - unconsumed input above `max_buffer` is cleared (lossy by intent)
//!
//! [`Framer::extract`] works on text; [`CotCodec`] applies the same scanner to a
//! `BytesMut` for use with `FramedRead`/`FramedWrite`.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::config::FramerConfig;
use crate::error::ProtocolError;
use crate::utils::metrics::TrafficCounters;

const EVENT_OPEN: &[u8] = b"<event";
const EVENT_CLOSE: &[u8] = b"</event";
const XML_DECL: &[u8] = b"<?xml";
const DECL_END: &[u8] = b"?>";

/// Outcome of scanning the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// `buf[skip..end]` is a complete message; everything before `skip` is garbage.
    Frame { skip: usize, end: usize },
    /// No complete message yet; `buf[..skip]` is garbage, the rest is pending.
    Incomplete { skip: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Start {
    Event(usize),
    Decl(usize),
    Partial(usize),
    None,
}

fn find(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= hay.len() || needle.len() > hay.len() - from {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn is_name_end(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'>' || b == b'/'
}

fn skip_ws(buf: &[u8], mut at: usize) -> usize {
    while at < buf.len() && buf[at].is_ascii_whitespace() {
        at += 1;
    }
    at
}

fn find_start(buf: &[u8], from: usize) -> Start {
    let mut i = from;
    while let Some(offset) = buf.get(i..).and_then(|tail| tail.iter().position(|&b| b == b'<')) {
        let lt = i + offset;
        let rest = &buf[lt..];
        if rest.starts_with(EVENT_OPEN) {
            match rest.get(EVENT_OPEN.len()) {
                None => return Start::Partial(lt),
                Some(&b) if is_name_end(b) => return Start::Event(lt),
                Some(_) => {}
            }
        } else if rest.starts_with(XML_DECL) {
            return Start::Decl(lt);
        } else if EVENT_OPEN.starts_with(rest) || XML_DECL.starts_with(rest) {
            return Start::Partial(lt);
        }
        i = lt + 1;
    }
    Start::None
}

/// Index of the `>` closing the tag that opens at `from`, honouring quoted attributes.
fn find_tag_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn next_event_after(buf: &[u8], from: usize) -> Option<usize> {
    let mut at = from;
    loop {
        match find_start(buf, at) {
            Start::Event(p) => return Some(p),
            Start::Decl(p) => at = p + 1,
            Start::Partial(_) | Start::None => return None,
        }
    }
}

enum Close {
    At(usize),
    Pending,
    Malformed(usize),
}

/// Locate the end of the event whose opening `<event` sits at `open`.
fn close_event(buf: &[u8], open: usize) -> Close {
    let Some(tag_end) = find_tag_end(buf, open) else {
        return match next_event_after(buf, open + 1) {
            Some(next) => Close::Malformed(next),
            None => Close::Pending,
        };
    };
    if buf[tag_end - 1] == b'/' {
        return Close::At(tag_end + 1);
    }

    let next_open = next_event_after(buf, tag_end);
    let mut search = tag_end;
    while let Some(c) = find(buf, EVENT_CLOSE, search) {
        if next_open.is_some_and(|n| n < c) {
            break;
        }
        let after = skip_ws(buf, c + EVENT_CLOSE.len());
        match buf.get(after) {
            None => return Close::Pending,
            Some(b'>') => return Close::At(after + 1),
            Some(_) => search = c + 1,
        }
    }
    match next_open {
        Some(next) => Close::Malformed(next),
        None => Close::Pending,
    }
}

fn next_frame(buf: &[u8]) -> Step {
    let mut from = 0;
    loop {
        match find_start(buf, from) {
            Start::None => return Step::Incomplete { skip: buf.len() },
            Start::Partial(p) => return Step::Incomplete { skip: p },
            Start::Decl(p) => {
                let Some(q) = find(buf, DECL_END, p) else {
                    return Step::Incomplete { skip: p };
                };
                let after = skip_ws(buf, q + DECL_END.len());
                if after == buf.len() {
                    return Step::Incomplete { skip: p };
                }
                match find_start(buf, after) {
                    Start::Event(e) if e == after => match close_event(buf, e) {
                        Close::At(end) => return Step::Frame { skip: p, end },
                        Close::Pending => return Step::Incomplete { skip: p },
                        Close::Malformed(next) => from = next,
                    },
                    Start::Partial(e) if e == after => return Step::Incomplete { skip: p },
                    // orphan declaration
                    _ => from = q + DECL_END.len(),
                }
            }
            Start::Event(p) => match close_event(buf, p) {
                Close::At(end) => return Step::Frame { skip: p, end },
                Close::Pending => return Step::Incomplete { skip: p },
                Close::Malformed(next) => from = next,
            },
        }
    }
}

fn is_noise(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| !b.is_ascii_whitespace())
}

/// Text framer applying the buffer guardrails from [`FramerConfig`].
#[derive(Debug, Clone, Default)]
pub struct Framer {
    config: FramerConfig,
}

impl Framer {
    pub fn new(config: FramerConfig) -> Self {
        Self { config }
    }

    /// Extract every complete event from `buffer`.
    ///
    /// Returns the extracted messages and the unconsumed remainder that should
    /// be prepended to the next read.
    pub fn extract(&self, buffer: &str) -> (Vec<String>, String) {
        let bytes = buffer.as_bytes();
        let mut messages = Vec::new();
        let mut offset = 0;

        loop {
            match next_frame(&bytes[offset..]) {
                Step::Frame { skip, end } => {
                    if is_noise(&bytes[offset..offset + skip]) {
                        trace!(discarded = skip, "Discarded bytes outside an event envelope");
                    }
                    messages.push(buffer[offset + skip..offset + end].to_string());
                    offset += end;
                }
                Step::Incomplete { skip } => {
                    if is_noise(&bytes[offset..offset + skip]) {
                        trace!(discarded = skip, "Discarded bytes outside an event envelope");
                    }
                    offset += skip;
                    break;
                }
            }
        }

        let remaining = &buffer[offset..];
        if remaining.len() > self.config.max_buffer {
            warn!(
                size = remaining.len(),
                limit = self.config.max_buffer,
                "Framer buffer exceeded hard limit, clearing"
            );
            return (messages, String::new());
        }
        if remaining.len() > self.config.warn_threshold {
            warn!(size = remaining.len(), "Framer buffer is growing large");
        }
        (messages, remaining.to_string())
    }
}

/// Streaming codec over CoT events.
///
/// Decodes into `String` (invalid UTF-8 replaced lossily) and encodes raw
/// payload bytes unchanged.
#[derive(Debug, Clone, Default)]
pub struct CotCodec {
    config: FramerConfig,
    counters: Option<Arc<TrafficCounters>>,
    warned: bool,
}

impl CotCodec {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            counters: None,
            warned: false,
        }
    }

    /// Count discarded fragments against `counters`.
    pub fn with_counters(mut self, counters: Arc<TrafficCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    fn discard(&self, src: &mut BytesMut, count: usize) {
        if count == 0 {
            return;
        }
        if is_noise(&src[..count]) {
            trace!(discarded = count, "Discarded bytes outside an event envelope");
            if let Some(counters) = &self.counters {
                counters.protocol_error();
            }
        }
        src.advance(count);
    }

    fn guard(&mut self, src: &mut BytesMut) {
        if src.len() > self.config.max_buffer {
            warn!(
                size = src.len(),
                limit = self.config.max_buffer,
                "Framer buffer exceeded hard limit, clearing"
            );
            if let Some(counters) = &self.counters {
                counters.protocol_error();
            }
            src.clear();
            self.warned = false;
        } else if src.len() > self.config.warn_threshold {
            if !self.warned {
                warn!(size = src.len(), "Framer buffer is growing large");
                self.warned = true;
            }
        } else {
            self.warned = false;
        }
    }
}

impl Decoder for CotCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match next_frame(src) {
            Step::Frame { skip, end } => {
                self.discard(src, skip);
                let frame = src.split_to(end - skip);
                self.warned = false;
                Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
            }
            Step::Incomplete { skip } => {
                self.discard(src, skip);
                self.guard(src);
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    trace!(pending = src.len(), "Dropping partial event at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for CotCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put(item);
        Ok(())
    }
}
