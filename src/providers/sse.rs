//! Server-sent event framing for streamed provider responses
//!
//! Response bodies arrive as arbitrary byte chunks. [`Utf8Decoder`] turns
//! them into text without splitting multi-byte characters, and
//! [`SseParser`] cuts that text into records separated by blank lines.

use async_stream::try_stream;
use futures::{Stream, StreamExt};

use super::ProviderError;

/// Incremental UTF-8 decoder.
///
/// Bytes of an incomplete trailing sequence are held back until the next
/// chunk arrives. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // incomplete sequence at the end, wait for more
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is still buffered at end of input
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// One event-stream record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The `[DONE]` sentinel used by OpenAI-style streams
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    decoder: Utf8Decoder,
    buffer: String,
}

impl SseParser {
    /// Feed one chunk of the body and collect every record it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = self.decoder.decode(chunk);
        self.buffer.push_str(&text);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let record: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_record(&record) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a final record that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let record = std::mem::take(&mut self.buffer);
        parse_record(&record)
    }
}

fn parse_record(record: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in record.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data.push(value),
            "event" => event = Some(value.to_string()),
            _ => {}
        }
    }

    if data.is_empty() && event.is_none() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Adapt a byte stream (such as `reqwest::Response::bytes_stream`) into a
/// stream of parsed records, in wire order.
pub fn event_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<SseEvent, ProviderError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ProviderError>,
{
    try_stream! {
        let mut parser = SseParser::default();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for event in parser.push(chunk.as_ref()) {
                yield event;
            }
        }

        if let Some(event) = parser.finish() {
            yield event;
        }
    }
}
