//! Token usage records and streaming usage extraction.
//!
//! Non-streaming responses carry usage in the response body; streaming
//! responses emit it in a final server-sent-event frame (when the upstream is
//! asked to include it). The [`SseStreamProcessor`] is fed every chunk as it
//! is forwarded to the client and keeps whatever usage it has seen so far, so
//! a stream that dies mid-flight still yields the best known accounting.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Token counts reported by an upstream for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Final accounting of a proxied stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Usage from the final usage frame, `None` if the upstream never
    /// emitted one.
    pub usage: Option<Usage>,
    /// Upstream-native cost in pico-USD, when the provider reports one.
    pub provider_cost_pico_usd: Option<U256>,
    /// Total body bytes forwarded to the client.
    pub bytes: u64,
}

/// Reads a usage object out of a JSON value shaped like an OpenAI response.
pub fn usage_from_json(value: &serde_json::Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let prompt_tokens = usage.get("prompt_tokens")?.as_u64()?;
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens + completion_tokens);
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

/// Reads a provider-native USD cost (e.g. OpenRouter's `usage.cost`) and
/// converts it to pico-USD.
pub fn provider_cost_from_json(value: &serde_json::Value) -> Option<U256> {
    let cost = value.get("usage")?.get("cost")?.as_f64()?;
    if !cost.is_finite() || cost < 0.0 {
        return None;
    }
    Some(U256::from((cost * 1e12) as u128))
}

/// Incremental parser for an SSE response stream.
///
/// Accumulates partial lines across chunk boundaries, watches `data:` frames
/// for a usage object, and counts forwarded bytes. `[DONE]` sentinels and
/// frames that fail to parse are ignored; a later usage frame supersedes an
/// earlier one.
#[derive(Debug, Default)]
pub struct SseStreamProcessor {
    line_buffer: Vec<u8>,
    usage: Option<Usage>,
    provider_cost_pico_usd: Option<U256>,
    bytes: u64,
}

impl SseStreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one forwarded chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        for byte in chunk {
            if *byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                self.process_line(&line);
            } else {
                self.line_buffer.push(*byte);
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        if let Some(usage) = usage_from_json(&value) {
            self.usage = Some(usage);
        }
        if let Some(cost) = provider_cost_from_json(&value) {
            self.provider_cost_pico_usd = Some(cost);
        }
    }

    /// Closes the processor; any buffered final line is processed first.
    pub fn finish(mut self) -> StreamOutcome {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.process_line(&line);
        }
        StreamOutcome {
            usage: self.usage,
            provider_cost_pico_usd: self.provider_cost_pico_usd,
            bytes: self.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_from_complete_body() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
        });
        assert_eq!(
            usage_from_json(&body),
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 34,
                total_tokens: 46
            })
        );
    }

    #[test]
    fn test_usage_null_is_none() {
        let body = serde_json::json!({"usage": null});
        assert_eq!(usage_from_json(&body), None);
    }

    #[test]
    fn test_stream_usage_in_final_frame() {
        let mut processor = SseStreamProcessor::new();
        processor.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}],\"usage\":null}\n\n");
        processor.feed(b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7,\"total_tokens\":12}}\n\n");
        processor.feed(b"data: [DONE]\n\n");
        let outcome = processor.finish();
        assert_eq!(
            outcome.usage,
            Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 7,
                total_tokens: 12
            })
        );
        assert!(outcome.bytes > 0);
    }

    #[test]
    fn test_stream_chunk_split_mid_line() {
        let mut processor = SseStreamProcessor::new();
        let frame = b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n";
        processor.feed(&frame[..20]);
        processor.feed(&frame[20..]);
        assert_eq!(processor.finish().usage.unwrap().total_tokens, 3);
    }

    #[test]
    fn test_stream_without_usage_frame() {
        let mut processor = SseStreamProcessor::new();
        processor.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n");
        processor.feed(b"data: [DONE]\n\n");
        let outcome = processor.finish();
        assert_eq!(outcome.usage, None);
    }

    #[test]
    fn test_final_line_without_newline_is_processed() {
        let mut processor = SseStreamProcessor::new();
        processor
            .feed(b"data: {\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":0,\"total_tokens\":2}}");
        assert_eq!(processor.finish().usage.unwrap().prompt_tokens, 2);
    }

    #[test]
    fn test_provider_cost_extraction() {
        let body = serde_json::json!({"usage": {"prompt_tokens": 1, "cost": 0.005}});
        assert_eq!(
            provider_cost_from_json(&body),
            Some(alloy_primitives::U256::from(5_000_000_000u64))
        );
    }

    #[test]
    fn test_garbage_frames_ignored() {
        let mut processor = SseStreamProcessor::new();
        processor.feed(b"data: not-json\n");
        processor.feed(b": keepalive comment\n");
        processor.feed(b"event: ping\n");
        assert_eq!(processor.finish().usage, None);
    }
}
