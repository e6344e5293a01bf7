//! Incremental `text/event-stream` decoder.
//!
//! Bytes arrive in arbitrary slices; only complete lines are decoded, so a
//! multi-byte character split across two network reads is reassembled
//! before UTF-8 validation. Lines end in `\n`, `\r\n` or a lone `\r`; a
//! trailing `\r` is held until the next byte shows which one it is.

use beacon_core::{EngineError, Result};

/// Decodes server-sent event frames into their `data` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some((end, consumed)) = self.next_line_end() {
            let line: Vec<u8> = self.buffer.drain(..consumed).take(end).collect();
            let line = std::str::from_utf8(&line)
                .map_err(|e| EngineError::protocol(format!("invalid UTF-8 in stream: {}", e)))?;
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Length of the next complete line and the bytes it occupies with its
    /// terminator.
    fn next_line_end(&self) -> Option<(usize, usize)> {
        let pos = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        if self.buffer[pos] == b'\n' {
            return Some((pos, pos + 1));
        }
        match self.buffer.get(pos + 1) {
            Some(b'\n') => Some((pos, pos + 2)),
            Some(_) => Some((pos, pos + 1)),
            None => None,
        }
    }

    /// Flush a final event that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Option<String>> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8(rest)
                .map_err(|e| EngineError::protocol(format!("invalid UTF-8 in stream: {}", e)))?;
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                return Ok(Some(event));
            }
        }
        Ok(self.dispatch())
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        // event, id and retry carry nothing the engine uses
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(payload)
    }
}
