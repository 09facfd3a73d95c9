//! # SSE decoding
//!
//! All three hosted providers stream responses as Server-Sent Events. This
//! module turns raw network chunks into `data:` payload strings:
//! - bytes are buffered until a full line arrives, so a multi-byte UTF-8
//!   sequence or a line split across chunks decodes correctly
//! - comments, `event:` lines, keep-alives and blank lines are dropped
//! - the `[DONE]` sentinel ends the stream
//!
//! Payloads are handed to the provider as strings; JSON parsing happens in
//! [`parse_sse_data`], which skips malformed events instead of failing.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use coach_core::CoachError;
use futures::{Future, Stream};
use tracing::warn;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Classification of one complete SSE line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
    Ignored,
}

pub fn classify_line(line: &str) -> SseLine {
    let trimmed = line.trim();

    if trimmed.is_empty() || trimmed.starts_with(':') {
        return SseLine::Ignored;
    }

    let Some(data) = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))
    else {
        return SseLine::Ignored;
    };

    match data.trim() {
        DONE_SENTINEL => SseLine::Done,
        "" => SseLine::Ignored,
        payload => SseLine::Data(payload.to_string()),
    }
}

/// Extract the data payload from an SSE line, if it carries one.
pub fn extract_sse_data(line: &str) -> Option<String> {
    match classify_line(line) {
        SseLine::Data(data) => Some(data),
        SseLine::Done | SseLine::Ignored => None,
    }
}

/// Incremental line decoder. The trailing partial line is kept between calls.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    terminated: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            terminated: false,
        }
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Feed one chunk and collect every payload it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        if self.terminated {
            return payloads;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(newline_pos);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }

            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                continue;
            };

            match classify_line(line) {
                SseLine::Data(data) => payloads.push(data),
                SseLine::Done => {
                    self.terminated = true;
                    self.buffer.clear();
                    break;
                }
                SseLine::Ignored => {}
            }
        }
        payloads
    }

    /// Decode whatever is left once the transport closes. A final event
    /// without a trailing newline is still delivered.
    pub fn finish(&mut self) -> Option<String> {
        if self.terminated || self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let line = std::str::from_utf8(&rest).ok()?;
        match classify_line(line) {
            SseLine::Data(data) => Some(data),
            SseLine::Done => {
                self.terminated = true;
                None
            }
            SseLine::Ignored => None,
        }
    }
}

/// Safely parse JSON from an SSE data string.
///
/// Returns `None` on parse failure with a warning log.
pub fn parse_sse_data<T: serde::de::DeserializeOwned>(data: &str, provider: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(
                provider = provider,
                error = %e,
                data_preview = %preview(data, 100),
                "failed to parse SSE data"
            );
            None
        }
    }
}

fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

/// Wraps a byte stream and yields SSE payloads.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
pub struct SseStream<E> {
    inner: ByteStream<E>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl<E> SseStream<E> {
    pub fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, E>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }
}

impl<E: Display> Stream for SseStream<E> {
    type Item = Result<String, CoachError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(payload)));
            }
            if self.finished || self.decoder.is_terminated() {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let payloads = self.decoder.push(&bytes);
                    self.pending.extend(payloads);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(CoachError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if let Some(payload) = self.decoder.finish() {
                        self.pending.push_back(payload);
                    }
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(CoachError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct TextEvent {
        text: String,
    }

    #[test]
    fn extract_data_line() {
        assert_eq!(
            extract_sse_data("data: {\"type\":\"message\"}"),
            Some("{\"type\":\"message\"}".into())
        );
        assert_eq!(extract_sse_data("data:{\"a\":1}"), Some("{\"a\":1}".into()));
    }

    #[test]
    fn non_data_lines_ignored() {
        assert_eq!(classify_line(": keep-alive"), SseLine::Ignored);
        assert_eq!(classify_line("event: content_block_delta"), SseLine::Ignored);
        assert_eq!(classify_line(""), SseLine::Ignored);
        assert_eq!(classify_line("data: "), SseLine::Ignored);
        assert_eq!(classify_line("data: [DONE]"), SseLine::Done);
    }

    #[test]
    fn partial_line_buffered_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"te").is_empty());
        assert_eq!(decoder.push(b"xt\":\"a\"}\n\n"), vec!["{\"text\":\"a\"}"]);
    }

    #[test]
    fn multibyte_sequence_split_across_chunks() {
        let line = "data: {\"text\":\"caf\u{e9} \u{1F600}\"}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        let payloads = decoder.push(&line[split..]);
        let event: TextEvent = parse_sse_data(&payloads[0], "test").unwrap();
        assert_eq!(event.text, "caf\u{e9} \u{1F600}");
    }

    #[test]
    fn crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"a\":1}\r\n\r\ndata: {\"a\":2}\r\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn done_sentinel_stops_decoding() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"a\":1}\ndata: [DONE]\ndata: {\"a\":2}\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
        assert!(decoder.is_terminated());
        assert!(decoder.push(b"data: {\"a\":3}\n").is_empty());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":1}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("{\"a\":1}"));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn malformed_json_skipped() {
        let mut decoder = SseDecoder::new();
        let mut payloads = decoder.push(b"data: {bad json\n");
        payloads.extend(decoder.push(b"data: {\"text\":\"hi\"}\n"));

        let texts: Vec<String> = payloads
            .iter()
            .filter_map(|p| parse_sse_data::<TextEvent>(p, "test"))
            .map(|e| e.text)
            .collect();
        assert_eq!(texts, vec!["hi"]);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("hi", 10), "hi");
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let mut stream = SseStream::with_idle_timeout(byte_stream, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(
                &event,
                Some(Err(CoachError::StreamInterrupted(msg))) if msg.contains("idle timeout")
            ),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let mut stream = SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        );

        tx.send(Ok(Bytes::from("data: ping\n\n"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "ping");

        tokio::time::advance(Duration::from_secs(4)).await;

        tx.send(Ok(Bytes::from("data: pong\n\n"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "pong");

        drop(tx);
        let event = stream.next().await;
        assert!(event.is_none(), "expected stream end, got: {event:?}");
    }

    #[tokio::test]
    async fn sse_stream_transport_error_ends_stream() {
        let chunks = vec![
            Ok(Bytes::from("data: one\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
            Ok(Bytes::from("data: two\n")),
        ];
        let mut stream =
            SseStream::with_idle_timeout(futures::stream::iter(chunks), Duration::from_secs(90));

        assert_eq!(stream.next().await.unwrap().unwrap(), "one");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CoachError::StreamInterrupted(ref m) if m.contains("reset by peer")));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_stream_stops_at_done_without_draining_transport() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let mut stream = SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(90),
        );

        tx.send(Ok(Bytes::from("data: last\n\ndata: [DONE]\n\n")))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "last");
        // Sender is still open; the stream must end on the sentinel alone.
        assert!(stream.next().await.is_none());
        drop(tx);
    }
}
