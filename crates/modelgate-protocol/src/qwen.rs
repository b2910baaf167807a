//! Alibaba Qwen (DashScope) generation wire types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QwenMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationInput {
    pub messages: Vec<QwenMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Always `message`; the legacy `text` result format is not relayed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// With `true`, stream frames carry only new text instead of the full
    /// accumulated output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental_output: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub input: GenerationInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<GenerationParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationChoice {
    pub message: QwenMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    #[serde(default)]
    pub choices: Vec<GenerationChoice>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QwenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub request_id: String,
    #[serde(default)]
    pub output: GenerationOutput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<QwenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GenerationResponse {
    pub fn error(&self) -> Option<(&str, &str)> {
        match (self.code.as_deref(), self.message.as_deref()) {
            (Some(code), Some(message)) if !code.is_empty() => Some((code, message)),
            _ => None,
        }
    }

    pub fn first_text(&self) -> &str {
        self.output
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .unwrap_or("")
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.output
            .choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
            // DashScope emits "null" (the string) on non-final stream frames.
            .filter(|reason| !reason.is_empty() && *reason != "null")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_decodes_message_format() {
        let body = r#"{
            "request_id": "r-1",
            "output": {"choices": [{"message": {"role": "assistant", "content": "好的"}, "finish_reason": "stop"}]},
            "usage": {"input_tokens": 10, "output_tokens": 3, "total_tokens": 13}
        }"#;
        let resp: GenerationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.first_text(), "好的");
        assert_eq!(resp.finish_reason(), Some("stop"));
        assert!(resp.error().is_none());
    }

    #[test]
    fn null_finish_reason_is_not_final() {
        let body = r#"{
            "request_id": "r-2",
            "output": {"choices": [{"message": {"role": "assistant", "content": "partial"}, "finish_reason": "null"}]}
        }"#;
        let resp: GenerationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.finish_reason(), None);
    }
}
