use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::warn;

use crate::api::{ChatMessage, ChatRequest, ChatStreamChunk};
use crate::utils::url::construct_api_url;

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Chunk(String),
    Error(String),
    End,
}

/// Incremental line splitter over arriving byte chunks.
///
/// An event split across network chunks is carried over until the rest
/// arrives; the splitter is independent of any HTTP client buffering.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete line, trimmed, or `None` when only a partial
    /// trailing line remains. Invalid UTF-8 lines are dropped with a warning.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line = match std::str::from_utf8(&self.buffer[..newline_pos]) {
                Ok(s) => Some(s.trim().to_string()),
                Err(err) => {
                    warn!(error = %err, "invalid UTF-8 in stream, dropping line");
                    None
                }
            };
            self.buffer.drain(..=newline_pos);
            if let Some(line) = line {
                return Some(line);
            }
        }
        None
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Handle one `data:` payload. Returns true when the stream is finished.
///
/// Malformed event records are skipped with a warning; they never abort the
/// stream. Role-only and finish-reason-only events carry no content and are
/// suppressed rather than delivered as empty chunks.
fn handle_data_payload(
    payload: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send((StreamMessage::End, stream_id));
        return true;
    }

    match serde_json::from_str::<ChatStreamChunk>(payload) {
        Ok(chunk) => {
            if let Some(choice) = chunk.choices.first() {
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty() {
                        let _ = tx.send((StreamMessage::Chunk(content.clone()), stream_id));
                    }
                }
            }
            false
        }
        Err(err) => {
            if !payload.trim().is_empty() {
                warn!(error = %err, payload, "skipping malformed stream event");
            }
            false
        }
    }
}

fn process_sse_line(
    line: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx, stream_id))
        .unwrap_or(false)
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub credential: String,
    pub model: String,
    pub api_messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

/// Spawns streaming completion calls and forwards their deltas, tagged with
/// a stream id, over a single channel consumed by the event loop.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Drive one streaming completion call on a background task.
    ///
    /// A failure emits `StreamMessage::Error` exactly once and no
    /// `StreamMessage::End`, even when deltas were already delivered.
    pub fn spawn_stream(&self, params: StreamParams) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                credential,
                model,
                api_messages,
                temperature,
                max_tokens,
                top_p,
                cancel_token,
                stream_id,
            } = params;

            let request = ChatRequest {
                model,
                messages: api_messages,
                stream: true,
                temperature,
                max_tokens,
                top_p,
            };

            tokio::select! {
                _ = async {
                    let chat_url = construct_api_url(&base_url, "chat/completions");
                    let response = client
                        .post(chat_url)
                        .header("Content-Type", "application/json")
                        .header("Authorization", format!("Bearer {credential}"))
                        .json(&request)
                        .send()
                        .await;

                    match response {
                        Ok(response) => {
                            if !response.status().is_success() {
                                let status = response.status();
                                let body = response
                                    .text()
                                    .await
                                    .unwrap_or_default();
                                let message = crate::api::client::extract_error_message(&body)
                                    .unwrap_or_else(|| {
                                        status
                                            .canonical_reason()
                                            .unwrap_or("request failed")
                                            .to_string()
                                    });
                                let _ = tx.send((
                                    StreamMessage::Error(format!("API error {status}: {message}")),
                                    stream_id,
                                ));
                                return;
                            }

                            let mut stream = response.bytes_stream();
                            let mut lines = LineBuffer::new();

                            while let Some(chunk) = stream.next().await {
                                if cancel_token.is_cancelled() {
                                    return;
                                }

                                match chunk {
                                    Ok(bytes) => {
                                        lines.push(&bytes);
                                        while let Some(line) = lines.next_line() {
                                            if process_sse_line(&line, &tx, stream_id) {
                                                return;
                                            }
                                        }
                                    }
                                    Err(err) => {
                                        let _ = tx.send((
                                            StreamMessage::Error(format!(
                                                "Stream interrupted: {err}"
                                            )),
                                            stream_id,
                                        ));
                                        return;
                                    }
                                }
                            }

                            let _ = tx.send((StreamMessage::End, stream_id));
                        }
                        Err(err) => {
                            let _ = tx.send((
                                StreamMessage::Error(format!("Request failed: {err}")),
                                stream_id,
                            ));
                        }
                    }
                } => {}
                _ = cancel_token.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        let (service, mut rx) = ChatStreamService::new();
        let variants = [
            (
                r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
                "Hello",
                "data: [DONE]",
            ),
            (
                r#"data:{"choices":[{"delta":{"content":"World"}}]}"#,
                "World",
                "data:[DONE]",
            ),
        ];

        for (index, (chunk_line, expected_chunk, done_line)) in variants.iter().enumerate() {
            let stream_id = (index + 1) as u64;

            assert!(!process_sse_line(chunk_line, &service.tx, stream_id));
            let (message, received_id) = rx.try_recv().expect("expected chunk message");
            assert_eq!(received_id, stream_id);
            match message {
                StreamMessage::Chunk(content) => assert_eq!(content, *expected_chunk),
                other => panic!("expected chunk message, got {:?}", other),
            }

            assert!(process_sse_line(done_line, &service.tx, stream_id));
            let (message, received_id) = rx.try_recv().expect("expected end message");
            assert_eq!(received_id, stream_id);
            assert!(matches!(message, StreamMessage::End));
        }

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_event_between_valid_events_is_skipped() {
        let (service, mut rx) = ChatStreamService::new();
        let stream_id = 7;

        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{"content":"TCP "}}]}"#,
            &service.tx,
            stream_id,
        ));
        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{"cont"#,
            &service.tx,
            stream_id,
        ));
        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{"content":"uses a three-way..."}}]}"#,
            &service.tx,
            stream_id,
        ));

        let (first, _) = rx.try_recv().expect("first valid delta");
        let (second, _) = rx.try_recv().expect("second valid delta");
        match (first, second) {
            (StreamMessage::Chunk(a), StreamMessage::Chunk(b)) => {
                assert_eq!(a, "TCP ");
                assert_eq!(b, "uses a three-way...");
            }
            other => panic!("expected two chunks, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn role_only_and_finish_only_events_are_suppressed() {
        let (service, mut rx) = ChatStreamService::new();
        let stream_id = 3;

        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#,
            &service.tx,
            stream_id,
        ));
        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            &service.tx,
            stream_id,
        ));
        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{"content":""}}]}"#,
            &service.tx,
            stream_id,
        ));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let (service, mut rx) = ChatStreamService::new();
        assert!(!process_sse_line("", &service.tx, 1));
        assert!(!process_sse_line(": keep-alive", &service.tx, 1));
        assert!(!process_sse_line("event: ping", &service.tx, 1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn line_buffer_carries_partial_lines_across_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"data: {\"choices\":[{\"delta\":");
        assert_eq!(lines.next_line(), None);

        lines.push(b"{\"content\":\"Hi\"}}]}\ndata: [DO");
        assert_eq!(
            lines.next_line(),
            Some(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#.to_string())
        );
        assert_eq!(lines.next_line(), None);

        lines.push(b"NE]\n");
        assert_eq!(lines.next_line(), Some("data: [DONE]".to_string()));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn line_buffer_splits_multiple_lines_in_one_chunk() {
        let mut lines = LineBuffer::new();
        lines.push(b"a\n\nb\r\n");
        assert_eq!(lines.next_line(), Some("a".to_string()));
        assert_eq!(lines.next_line(), Some("".to_string()));
        assert_eq!(lines.next_line(), Some("b".to_string()));
        assert_eq!(lines.next_line(), None);
    }
}
