//! Response body framing
//!
//! Turns a raw byte stream into discrete events, either standard
//! server-sent events or complete JSON objects separated by blank lines.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use synapse_config::StreamFraming;

use crate::error::LlmError;

/// Upstream response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

/// Framed events ready for a decoder
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, LlmError>> + Send>>;

/// How a provider frames its streamed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// `event:`/`data:` lines terminated by a blank line
    #[default]
    Sse,
    /// Whole JSON objects separated by blank lines
    JsonBlocks,
}

impl From<StreamFraming> for Framing {
    fn from(value: StreamFraming) -> Self {
        match value {
            StreamFraming::Sse => Self::Sse,
            StreamFraming::JsonBlocks => Self::JsonBlocks,
        }
    }
}

/// One framed event before provider decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// SSE event name, when the provider sets one
    pub event: Option<String>,
    /// Event payload
    pub data: String,
}

impl RawEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

/// Body stream of a `reqwest` response
pub fn response_body(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(LlmError::from)))
}

/// Split a body into events according to `framing`
pub fn frame(body: ByteStream, framing: Framing) -> EventStream {
    match framing {
        Framing::Sse => sse_events(body),
        Framing::JsonBlocks => json_blocks(body),
    }
}

fn sse_events(body: ByteStream) -> EventStream {
    Box::pin(body.eventsource().filter_map(|result| {
        std::future::ready(match result {
            // comments and keep-alives
            Ok(event) if event.data.is_empty() => None,
            Ok(event) => Some(Ok(RawEvent {
                event: (!event.event.is_empty() && event.event != "message").then_some(event.event),
                data: event.data,
            })),
            Err(EventStreamError::Transport(e)) => Some(Err(e)),
            Err(e) => Some(Err(LlmError::Streaming(e.to_string()))),
        })
    }))
}

fn json_blocks(body: ByteStream) -> EventStream {
    let splitter = BlockSplitter {
        body,
        utf8: Utf8Decoder::default(),
        buffer: String::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(splitter, |mut s| async move {
        loop {
            if let Some(block) = s.ready.pop_front() {
                return Some((Ok(RawEvent::data(block)), s));
            }
            if s.finished {
                return None;
            }

            match s.body.next().await {
                Some(Ok(bytes)) => {
                    let text = s.utf8.decode(&bytes);
                    s.push(&text);
                }
                Some(Err(e)) => {
                    s.finished = true;
                    return Some((Err(e), s));
                }
                None => {
                    s.finished = true;
                    let tail = s.utf8.finish();
                    s.push(&tail);
                    let rest = std::mem::take(&mut s.buffer);
                    s.enqueue(&rest);
                }
            }
        }
    }))
}

struct BlockSplitter {
    body: ByteStream,
    utf8: Utf8Decoder,
    buffer: String,
    ready: VecDeque<String>,
    finished: bool,
}

impl BlockSplitter {
    fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            self.enqueue(&block);
        }
    }

    /// Queue one block, tolerating the array punctuation of a streamed JSON
    /// array (`[`, `,`, `]`) around each object
    fn enqueue(&mut self, block: &str) {
        let trimmed = block
            .trim()
            .trim_start_matches(|c| c == '[' || c == ',')
            .trim_end_matches(|c| c == ']' || c == ',')
            .trim();

        if !trimmed.is_empty() {
            self.ready.push_back(trimmed.to_owned());
        }
    }
}

/// Incremental UTF-8 decoder that holds back incomplete trailing sequences
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much of `bytes` as forms complete characters
    ///
    /// Invalid sequences become U+FFFD; an incomplete sequence at the end is
    /// kept for the next call.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_len]));

                    match e.error_len() {
                        Some(bad_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_len + bad_len);
                        }
                        None => {
                            self.pending.drain(..valid_len);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of input
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    fn body(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))))
    }

    async fn collect(events: EventStream) -> Vec<RawEvent> {
        events.map(|e| e.unwrap()).collect().await
    }

    #[test]
    fn utf8_decoder_holds_back_split_character() {
        let mut decoder = Utf8Decoder::default();
        let euro = "€".as_bytes();

        assert_eq!(decoder.decode(&[b'a', euro[0]]), "a");
        assert_eq!(decoder.decode(&euro[1..2]), "");
        assert_eq!(decoder.decode(&[euro[2], b'b']), "€b");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'x', 0xFF, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn utf8_decoder_flushes_truncated_tail_lossily() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn sse_events_carry_names_and_data() {
        let events = frame(
            body(vec![
                b"event: content_block_delta\ndata: {\"a\":",
                b"1}\n\n: keep-alive\n\ndata: [DONE]\n\n",
            ]),
            Framing::Sse,
        );

        let events = collect(events).await;
        assert_eq!(
            events,
            vec![
                RawEvent {
                    event: Some("content_block_delta".to_owned()),
                    data: "{\"a\":1}".to_owned(),
                },
                RawEvent::data("[DONE]"),
            ]
        );
    }

    #[tokio::test]
    async fn sse_keeps_multibyte_text_intact_across_chunks() {
        let payload = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let (head, tail) = payload.split_at(split);

        let events = frame(body(vec![head, tail]), Framing::Sse);
        let events = collect(events).await;
        assert_eq!(events, vec![RawEvent::data("{\"t\":\"héllo\"}")]);
    }

    #[tokio::test]
    async fn json_blocks_split_on_blank_lines() {
        let events = frame(
            body(vec![b"{\"a\":1}\r\n\r", b"\n{\"b\":", b"2}\n\n{\"c\":3}"]),
            Framing::JsonBlocks,
        );

        let events = collect(events).await;
        let data: Vec<_> = events.into_iter().map(|e| e.data).collect();
        assert_eq!(data, ["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    }

    #[tokio::test]
    async fn json_blocks_strip_array_punctuation() {
        let events = frame(body(vec![b"[{\"a\":1}\n\n,{\"b\":2}\n\n]"]), Framing::JsonBlocks);

        let data: Vec<_> = collect(events).await.into_iter().map(|e| e.data).collect();
        assert_eq!(data, ["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn json_blocks_surface_transport_errors() {
        let chunks: Vec<Result<Bytes, LlmError>> = vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n\n")),
            Err(LlmError::Transport("connection reset".to_owned())),
        ];
        let mut events = frame(Box::pin(stream::iter(chunks)), Framing::JsonBlocks);

        assert_eq!(events.next().await.unwrap().unwrap().data, "{\"a\":1}");
        assert!(matches!(events.next().await, Some(Err(LlmError::Transport(_)))));
        assert!(events.next().await.is_none());
    }
}
