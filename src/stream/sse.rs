//! Server-sent-events transport.
//!
//! The controller only sees three things from a transport: the connection
//! opened (`connect` resolved), a text message arrived (a stream item), or the
//! connection failed or ended (an error item or end of stream). Everything
//! else about the channel stays inside this module.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use thiserror::Error;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const EVENT_STREAM_MEDIA_TYPE: &str = "text/event-stream";

/// Largest event, pending line plus accumulated data, a connection may buffer.
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Inbound text messages of one open connection.
pub type MessageStream = BoxStream<'static, Result<String, TransportError>>;

/// Connection-level failures. These drive reconnects and are never handed to
/// subscribers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("unexpected content type {content_type:?}")]
    UnexpectedContentType { content_type: String },

    #[error("event exceeds {limit} bytes")]
    EventTooLarge { limit: usize },

    #[error("connect timed out")]
    Timeout,

    #[error("stream closed by server")]
    Closed,
}

/// Opens one long-lived server-push connection.
pub trait Transport: Send + Sync + 'static {
    /// Resolves once the connection is established and yields its messages.
    fn connect(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> BoxFuture<'static, Result<MessageStream, TransportError>>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn connect(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
        (**self).connect(url, headers)
    }
}

/// `text/event-stream` transport over a shared reqwest client.
#[derive(Clone, Debug)]
pub struct SseTransport {
    http: Client,
}

impl SseTransport {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl Transport for SseTransport {
    fn connect(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
        let request = self
            .http
            .get(url)
            .headers(headers)
            .header(ACCEPT, EVENT_STREAM_MEDIA_TYPE)
            .header(CACHE_CONTROL, "no-cache");

        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::HttpStatus {
                    status,
                    body: body.chars().take(ERROR_BODY_SNIPPET_LEN).collect(),
                });
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if !is_event_stream(content_type) {
                return Err(TransportError::UnexpectedContentType {
                    content_type: content_type.to_string(),
                });
            }

            let events = sse_messages(response.bytes_stream()).boxed();
            Ok(events)
        }
        .boxed()
    }
}

fn is_event_stream(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default();
    media_type.trim().eq_ignore_ascii_case(EVENT_STREAM_MEDIA_TYPE)
}

/// Frames a chunked byte stream into event data payloads.
///
/// A read error or an oversized event ends the stream after yielding it.
pub fn sse_messages<S>(byte_stream: S) -> impl Stream<Item = Result<String, TransportError>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    stream::unfold(
        (Box::pin(byte_stream), SseDecoder::default(), Vec::new().into_iter(), false),
        |(mut bytes, mut decoder, mut ready, done)| async move {
            loop {
                if let Some(data) = ready.next() {
                    return Some((Ok(data), (bytes, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => match decoder.feed(&chunk) {
                        Ok(events) => ready = events.into_iter(),
                        Err(failure) => {
                            return Some((Err(failure), (bytes, decoder, ready, true)));
                        }
                    },
                    Some(Err(err)) => {
                        let failure = TransportError::from(err);
                        return Some((Err(failure), (bytes, decoder, ready, true)));
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Incremental event-stream framer.
///
/// Lines end in `\n`, `\r\n` or a bare `\r`. `data:` lines accumulate until a
/// blank line dispatches them joined by `\n`. Comments and the `event`, `id`
/// and `retry` fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no line terminator.
    scanned: usize,
    /// Last line ended in `\r`; a `\n` opening the next chunk belongs to it.
    skip_lf: bool,
    data: Option<String>,
}

impl SseDecoder {
    /// Feeds a chunk and returns every event it completed.
    ///
    /// Fails once the pending line and undispatched data together exceed
    /// [`MAX_EVENT_BYTES`]; the decoder should be discarded after that.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, TransportError> {
        let mut chunk = chunk;
        if self.skip_lf && !chunk.is_empty() {
            self.skip_lf = false;
            if chunk[0] == b'\n' {
                chunk = &chunk[1..];
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
        {
            let line_end = self.scanned + offset;
            let mut consumed = line_end + 1;
            if self.buffer[line_end] == b'\r' {
                match self.buffer.get(consumed).copied() {
                    Some(b'\n') => consumed += 1,
                    Some(_) => {}
                    None => self.skip_lf = true,
                }
            }
            let line = self.buffer.split_to(consumed);
            self.scanned = 0;

            // Invalid UTF-8 lines are dropped; the event framing survives.
            let Ok(line) = std::str::from_utf8(&line[..line_end]) else {
                continue;
            };
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
            self.check_size()?;
        }
        self.scanned = self.buffer.len();
        self.check_size()?;
        Ok(events)
    }

    /// Bytes held for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn check_size(&self) -> Result<(), TransportError> {
        let buffered = self.buffer.len() + self.data.as_ref().map_or(0, String::len);
        if buffered > MAX_EVENT_BYTES {
            return Err(TransportError::EventTooLarge {
                limit: MAX_EVENT_BYTES,
            });
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.data.take();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        None
    }
}
