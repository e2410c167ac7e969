use std::error::Error as StdError;
use std::fmt;

use serde_json::Value;

use crate::api::{ChatCompletionResponse, ChatRequest, Usage};
use crate::core::constants::UNUSED_CREDENTIAL;
use crate::utils::url::construct_api_url;

/// Errors surfaced by the completion client.
#[derive(Debug)]
pub enum ClientError {
    /// Network-level failure: no response from the remote at all.
    Transport(reqwest::Error),

    /// The remote answered with a non-success status.
    Api { status: u16, message: String },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(source) => write!(f, "Request failed: {source}"),
            ClientError::Api { status, message } => {
                write!(f, "API error {status}: {message}")
            }
        }
    }
}

impl StdError for ClientError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ClientError::Transport(source) => Some(source),
            ClientError::Api { .. } => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(source: reqwest::Error) -> Self {
        ClientError::Transport(source)
    }
}

/// Full (non-streaming) completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
}

/// Client for a single OpenAI-compatible completion service.
///
/// Carries a mutable bearer credential; without an explicit credential the
/// sentinel `"unused"` is sent and the service tier is decided server-side.
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
    credential: String,
}

impl CompletionClient {
    pub fn new(base_url: impl Into<String>, credential: Option<String>) -> Self {
        CompletionClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credential: credential
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| UNUSED_CREDENTIAL.to_string()),
        }
    }

    pub fn set_credential(&mut self, credential: String) {
        self.credential = if credential.trim().is_empty() {
            UNUSED_CREDENTIAL.to_string()
        } else {
            credential
        };
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Perform a single non-streaming completion request and return the full
    /// completion text plus usage metadata.
    pub async fn complete(&self, request: &ChatRequest) -> Result<Completion, ClientError> {
        let url = construct_api_url(&self.base_url, "chat/completions");
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.credential))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: ChatCompletionResponse = response.json().await?;
        let content = body
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default();

        Ok(Completion {
            content,
            usage: body.usage,
        })
    }

    /// Fetch the identifiers of the models offered by the service.
    pub async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        let url = construct_api_url(&self.base_url, "models");
        let response = self
            .http
            .get(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.credential))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: Value = response.json().await?;
        Ok(extract_model_ids(&body))
    }
}

async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });
    ClientError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Best-effort extraction of a human-readable message from a JSON error body.
pub(crate) fn extract_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body.trim()).ok()?;

    let message = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        })?;

    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// The models endpoint returns either a bare JSON array of `{id}` objects or
/// an OpenAI-style `{"data": [...]}` envelope. Empty ids are filtered out.
fn extract_model_ids(body: &Value) -> Vec<String> {
    let entries = match body {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };

    entries
        .iter()
        .filter_map(|entry| entry.get("id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_defaults_to_sentinel() {
        let client = CompletionClient::new("https://api.example.com/v1", None);
        assert_eq!(client.credential(), UNUSED_CREDENTIAL);

        let client = CompletionClient::new("https://api.example.com/v1", Some("  ".to_string()));
        assert_eq!(client.credential(), UNUSED_CREDENTIAL);
    }

    #[test]
    fn set_credential_replaces_and_restores_sentinel() {
        let mut client = CompletionClient::new("https://api.example.com/v1", None);
        client.set_credential("tok-123".to_string());
        assert_eq!(client.credential(), "tok-123");

        client.set_credential(String::new());
        assert_eq!(client.credential(), UNUSED_CREDENTIAL);
    }

    #[test]
    fn extract_error_message_reads_nested_error_object() {
        let body = r#"{"error":{"message":"model   overloaded"}}"#;
        assert_eq!(
            extract_error_message(body),
            Some("model overloaded".to_string())
        );
    }

    #[test]
    fn extract_error_message_reads_flat_variants() {
        assert_eq!(
            extract_error_message(r#"{"error":"quota exceeded"}"#),
            Some("quota exceeded".to_string())
        );
        assert_eq!(
            extract_error_message(r#"{"message":"bad request"}"#),
            Some("bad request".to_string())
        );
    }

    #[test]
    fn extract_error_message_rejects_non_json() {
        assert_eq!(extract_error_message("<html>nope</html>"), None);
        assert_eq!(extract_error_message(""), None);
    }

    #[test]
    fn extract_model_ids_handles_bare_array() {
        let body: Value =
            serde_json::from_str(r#"[{"id":"gpt-4o-mini"},{"id":""},{"id":"deepseek-chat"}]"#)
                .unwrap();
        assert_eq!(
            extract_model_ids(&body),
            vec!["gpt-4o-mini".to_string(), "deepseek-chat".to_string()]
        );
    }

    #[test]
    fn extract_model_ids_handles_data_envelope() {
        let body: Value =
            serde_json::from_str(r#"{"object":"list","data":[{"id":"gpt-4o"}]}"#).unwrap();
        assert_eq!(extract_model_ids(&body), vec!["gpt-4o".to_string()]);
    }

    #[test]
    fn extract_model_ids_tolerates_unexpected_shapes() {
        let body: Value = serde_json::from_str(r#"{"models":["a","b"]}"#).unwrap();
        assert!(extract_model_ids(&body).is_empty());
    }
}
