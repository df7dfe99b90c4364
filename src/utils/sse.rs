use bytes::Bytes;

use crate::gateway::types::TokenUsage;
use crate::gateway::upstream::parse_usage;

const MAX_SCANNED_LINE_BYTES: usize = 256 * 1024;

pub fn data_event(payload: &str) -> Bytes {
    let mut out = String::with_capacity(payload.len() + 8);
    out.push_str("data: ");
    out.push_str(payload);
    out.push_str("\n\n");
    Bytes::from(out)
}

pub fn done_event() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Watches a pass-through event stream for a `usage` object without buffering the
/// whole stream. Lines longer than the scan limit are skipped.
#[derive(Debug, Default)]
pub struct SseUsageScanner {
    line: Vec<u8>,
    overflowed: bool,
    usage: Option<TokenUsage>,
}

impl SseUsageScanner {
    pub fn feed(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' {
                if !self.overflowed {
                    self.scan_line();
                }
                self.line.clear();
                self.overflowed = false;
                continue;
            }
            if self.overflowed {
                continue;
            }
            if self.line.len() >= MAX_SCANNED_LINE_BYTES {
                self.overflowed = true;
                self.line.clear();
                continue;
            }
            self.line.push(byte);
        }
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    fn scan_line(&mut self) {
        let line = trim_ascii_end(&self.line);
        let Some(data) = line.strip_prefix(b"data:") else {
            return;
        };
        let data = trim_ascii_start(data);
        if data == b"[DONE]" {
            return;
        }
        if let Some(usage) = parse_usage(data) {
            self.usage = Some(usage);
        } else if let Some(usage) = parse_nested_response_usage(data) {
            self.usage = Some(usage);
        }
    }
}

/// Responses API streams carry usage under `response.usage` of the completed event.
fn parse_nested_response_usage(data: &[u8]) -> Option<TokenUsage> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    let response = value.get("response")?;
    let raw = serde_json::to_vec(response).ok()?;
    parse_usage(&raw)
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(0);
    &bytes[..end]
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_picks_usage_across_chunk_boundaries() {
        let mut scanner = SseUsageScanner::default();
        scanner.feed(b"data: {\"choices\":[]}\n\ndata: {\"usage\":{\"prompt_");
        assert_eq!(scanner.usage(), None);
        scanner.feed(b"tokens\":2,\"completion_tokens\":9}}\n\ndata: [DONE]\n\n");
        assert_eq!(
            scanner.usage(),
            Some(TokenUsage {
                input_tokens: 2,
                output_tokens: 9
            })
        );
    }

    #[test]
    fn scanner_reads_responses_completed_event() {
        let mut scanner = SseUsageScanner::default();
        scanner.feed(
            b"event: response.completed\ndata: {\"response\":{\"usage\":{\"input_tokens\":4,\"output_tokens\":6}}}\n\n",
        );
        assert_eq!(scanner.usage().map(|usage| usage.total()), Some(10));
    }

    #[test]
    fn data_event_frames_payload() {
        assert_eq!(data_event("{}"), Bytes::from_static(b"data: {}\n\n"));
    }
}
