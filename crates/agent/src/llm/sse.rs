//! Server-sent-events framing for chat-completions streams.

use std::fmt::Display;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("stream read error: {0}")]
pub struct SseReadError(pub String);

struct Framer<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Splits a byte stream into SSE events and yields each event's joined `data:` payload.
///
/// Keep-alives and comment lines are skipped. The stream ends at `[DONE]` or end of body.
pub fn sse_data_stream<S, B, E>(body: S) -> impl Stream<Item = Result<String, SseReadError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let framer = Framer { body: Box::pin(body), buffer: Vec::new(), finished: false };

    stream::unfold(framer, |mut framer| async move {
        loop {
            if framer.finished {
                return None;
            }

            if let Some(boundary) = find_boundary(&framer.buffer) {
                let event: Vec<u8> = framer.buffer.drain(..boundary + 2).collect();
                match event_data(&event[..boundary]) {
                    EventData::Payload(data) => return Some((Ok(data), framer)),
                    EventData::Done => {
                        framer.finished = true;
                        return None;
                    }
                    EventData::Empty => continue,
                }
            }

            match framer.body.next().await {
                Some(Ok(bytes)) => {
                    framer.buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(error)) => {
                    framer.finished = true;
                    return Some((Err(SseReadError(error.to_string())), framer));
                }
                None => {
                    framer.finished = true;
                    let rest = std::mem::take(&mut framer.buffer);
                    return match event_data(&rest) {
                        EventData::Payload(data) => Some((Ok(data), framer)),
                        EventData::Done | EventData::Empty => None,
                    };
                }
            }
        }
    })
}

enum EventData {
    Payload(String),
    Done,
    Empty,
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn event_data(event: &[u8]) -> EventData {
    let text = String::from_utf8_lossy(event);
    let mut lines = Vec::new();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else { continue };
        let data = data.trim();
        if data == DONE_SENTINEL {
            return EventData::Done;
        }
        lines.push(data);
    }

    if lines.iter().all(|line| line.is_empty()) {
        EventData::Empty
    } else {
        EventData::Payload(lines.join("\n"))
    }
}
