//! Request and response bodies of the OpenAI-compatible completions API.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// A model entry from `GET /models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelList {
    #[serde(default)]
    pub data: Vec<ModelInfo>,
}

/// Body of `POST /completions`.
#[derive(Debug, Clone, PartialEq, Serialize, TypedBuilder)]
pub struct CompletionRequest {
    #[builder(setter(into))]
    pub model: String,

    #[builder(setter(into))]
    pub prompt: String,

    #[builder(default = 2048)]
    pub max_tokens: u32,

    #[builder(default = 0.7)]
    pub temperature: f32,

    #[builder(default = 0.9)]
    pub top_p: f32,

    #[builder(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// Token accounting reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// Text of the first choice of a successful completion.
///
/// `text` may be empty; deciding whether that is acceptable is left to the
/// caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Pull a human-readable message out of an error response body.
///
/// Understands `{"error": {"message": ".."}}`, `{"error": ".."}` and
/// `{"message": ".."}`.
pub(crate) fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = match value.get("error") {
        Some(serde_json::Value::String(s)) => Some(s.as_str()),
        Some(obj) => obj.get("message").and_then(|m| m.as_str()),
        None => value.get("message").and_then(|m| m.as_str()),
    };
    message.filter(|m| !m.is_empty()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_omit_empty_stop_sequences() {
        let request = CompletionRequest::builder()
            .model("m")
            .prompt("p")
            .build();
        let json = serde_json::to_value(&request).expect("should serialize");
        assert!(json.get("stop").is_none());
        assert_eq!(json["max_tokens"], 2048);
    }

    #[test]
    fn test_should_parse_completion_response_with_missing_fields() {
        let response: CompletionResponse =
            serde_json::from_str(r#"{"choices":[{"index":0}]}"#).expect("should parse");
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].text, "");
        assert!(response.usage.is_none());
    }

    #[test]
    fn test_should_extract_error_messages() {
        assert_eq!(
            error_message(r#"{"error":{"message":"model not loaded","type":"x"}}"#).as_deref(),
            Some("model not loaded")
        );
        assert_eq!(
            error_message(r#"{"error":"bad prompt"}"#).as_deref(),
            Some("bad prompt")
        );
        assert_eq!(
            error_message(r#"{"message":"overloaded"}"#).as_deref(),
            Some("overloaded")
        );
        assert_eq!(error_message("<html>502</html>"), None);
    }

    #[test]
    fn test_should_accumulate_token_usage() {
        let mut total = TokenUsage::default();
        total += TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        total += TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        };
        assert_eq!(total.total_tokens, 18);
        assert_eq!(total.prompt_tokens, 11);
    }
}
