use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

use crate::api::client::CompletionClient;
use crate::api::{ChatMessage, ChatRequest};
use crate::core::constants::{
    DEFAULT_TITLE, FALLBACK_TITLE_MAX_CHARS, TITLE_MAX_CHARS, TITLE_MAX_TOKENS, TITLE_MODEL,
    TITLE_TEMPERATURE,
};
use crate::core::message::Message;

/// How many leading messages are given to the model as titling context.
const TITLE_CONTEXT_MESSAGES: usize = 4;

/// Derive a session title from the first user message.
///
/// Takes the leading sentence when it fits within the limit, otherwise the
/// first 50 characters of the content with an ellipsis. Returns "New Chat"
/// when there is no user message to draw from.
pub fn fallback_title(messages: &[Message]) -> String {
    let Some(first_user) = messages.iter().find(|m| m.is_user()) else {
        return DEFAULT_TITLE.to_string();
    };

    let content = first_user.content.trim();
    let first_sentence = content
        .split(['.', '!', '?'])
        .next()
        .unwrap_or(content)
        .trim();

    if first_sentence.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if grapheme_count(first_sentence) <= FALLBACK_TITLE_MAX_CHARS {
        return first_sentence.to_string();
    }
    format!("{}...", truncate_graphemes(content, FALLBACK_TITLE_MAX_CHARS))
}

/// Ask the completion service for a short descriptive title, falling back to
/// the heuristic on any failure. Errors are logged and swallowed; title
/// synthesis must never surface to the user.
pub async fn synthesize_title(client: &CompletionClient, messages: &[Message]) -> String {
    match request_title(client, messages).await {
        Some(title) => title,
        None => fallback_title(messages),
    }
}

async fn request_title(client: &CompletionClient, messages: &[Message]) -> Option<String> {
    let context: Vec<&Message> = messages.iter().take(TITLE_CONTEXT_MESSAGES).collect();
    if context.is_empty() {
        return None;
    }

    let transcript = context
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Based on the following conversation, generate a concise, descriptive title \
         (maximum 6 words, no quotes or punctuation):\n\n{transcript}\n\nTitle:"
    );

    let request = ChatRequest {
        model: TITLE_MODEL.to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: prompt,
        }],
        stream: false,
        temperature: Some(TITLE_TEMPERATURE),
        max_tokens: Some(TITLE_MAX_TOKENS),
        top_p: None,
    };

    match client.complete(&request).await {
        Ok(completion) => {
            let title = clean_title(&completion.content);
            if title.is_empty() {
                None
            } else {
                Some(title)
            }
        }
        Err(err) => {
            warn!(error = %err, "title synthesis failed, using fallback");
            None
        }
    }
}

/// Strip surrounding quotes and trailing punctuation from a model-produced
/// title, then truncate to the display limit.
pub(crate) fn clean_title(raw: &str) -> String {
    let mut title = raw.trim();
    title = title.strip_prefix(['"', '\'']).unwrap_or(title);
    title = title.strip_suffix(['"', '\'']).unwrap_or(title);
    let title = title.trim_end_matches(['.', '!', '?']).trim();
    truncate_graphemes(title, TITLE_MAX_CHARS)
}

fn grapheme_count(text: &str) -> usize {
    text.graphemes(true).count()
}

fn truncate_graphemes(text: &str, limit: usize) -> String {
    text.graphemes(true).take(limit).collect()
}
