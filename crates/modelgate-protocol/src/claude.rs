//! Anthropic Messages API wire types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    /// Leading `system` role messages are hoisted here; the messages array
    /// itself only carries user/assistant turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Required by the API; the relay substitutes a default when the
    /// downstream request omits it.
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub usage: ClaudeUsage,
}

impl MessagesResponse {
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            let ContentBlock::Text { text } = block;
            out.push_str(text);
        }
        out
    }
}

// ---- streaming events ----
//
// The Messages stream is named-event SSE; the relay only consumes the
// subset of events that carry text deltas, usage, or termination.

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamMessageStart {
    pub message: StreamMessageHead,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamMessageHead {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: ClaudeUsage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamContentDelta {
    pub index: u32,
    pub delta: StreamTextDelta,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamTextDelta {
    TextDelta { text: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamMessageDelta {
    pub delta: StreamStopDelta,
    #[serde(default)]
    pub usage: Option<StreamOutputUsage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamStopDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StreamOutputUsage {
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_sums_usage() {
        let body = r#"{
            "id": "msg_01",
            "model": "claude-3-haiku",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": "!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.joined_text(), "Hello!");
        assert_eq!(resp.usage.input_tokens, 12);
        assert_eq!(resp.usage.output_tokens, 7);
    }

    #[test]
    fn content_block_delta_decodes() {
        let body = r#"{"index":0,"delta":{"type":"text_delta","text":"wor"}}"#;
        let delta: StreamContentDelta = serde_json::from_str(body).unwrap();
        let StreamTextDelta::TextDelta { text } = delta.delta;
        assert_eq!(text, "wor");
    }
}
