//! Incremental parsing of streamed run-event records.
//!
//! The wire format is SSE-shaped: text frames with `event:`/`data:`/`id:`
//! fields, separated by a blank line. Frames arrive in arbitrary chunk
//! boundaries; a partial frame is retained until its remainder arrives.

use thiserror::Error;

use crate::models::RunEvent;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Malformed stream record: {0}")]
    MalformedRecord(String),
}

/// One parsed wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Decode the run event carried in this frame's data.
    pub fn into_run_event(self) -> Result<RunEvent, StreamError> {
        serde_json::from_str(&self.data)
            .map_err(|error| StreamError::MalformedRecord(format!("{error}: {}", self.data)))
    }
}

/// Rolling buffer that splits a chunked byte stream into complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed.
    ///
    /// Leftover bytes of a partial frame stay buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, skip)) = find_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + skip).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Whether a partial frame is still buffered
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Find the earliest blank-line record boundary.
///
/// Returns the frame end offset and the boundary length to skip.
fn find_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut index = 0;
    while index < buffer.len() {
        if buffer[index] == b'\n' {
            match buffer.get(index + 1) {
                Some(b'\n') => return Some((index + 1, 1)),
                Some(b'\r') if buffer.get(index + 2) == Some(&b'\n') => {
                    return Some((index + 1, 2));
                }
                _ => {}
            }
        }
        index += 1;
    }
    None
}

/// Parse the field lines of one frame.
///
/// Comment lines (leading `:`) and unknown fields are ignored; multiple
/// `data:` lines are joined with newlines per the SSE convention. Returns
/// `None` for a frame with no recognized fields.
fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut id = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = line
            .split_once(':')
            .map_or((line, ""), |(field, value)| {
                (field, value.strip_prefix(' ').unwrap_or(value))
            });

        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.is_none() && id.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
        id,
    })
}
