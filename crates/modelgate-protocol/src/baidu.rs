//! Baidu ERNIE chat wire types.
//!
//! The ERNIE endpoint only accepts alternating user/assistant messages; the
//! system prompt travels in a dedicated top-level field. Errors come back as
//! HTTP 200 bodies carrying `error_code` / `error_msg`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErnieMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErnieChatRequest {
    pub messages: Vec<ErnieMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErnieUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Non-stream response and stream event share one shape; stream events set
/// `is_end` on the final frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErnieChatResponse {
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub is_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ErnieUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl ErnieChatResponse {
    pub fn error(&self) -> Option<(i64, &str)> {
        match (self.error_code, self.error_msg.as_deref()) {
            (Some(code), Some(msg)) if code != 0 => Some((code, msg)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_error_is_detected() {
        let body = r#"{"id":"","error_code":110,"error_msg":"Access token invalid"}"#;
        let resp: ErnieChatResponse = serde_json::from_str(body).unwrap();
        let (code, msg) = resp.error().unwrap();
        assert_eq!(code, 110);
        assert!(msg.contains("token"));
    }

    #[test]
    fn stream_frame_carries_is_end() {
        let body = r#"{"id":"as-1","created":1,"result":"你好","is_end":true,
            "usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        let resp: ErnieChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.is_end, Some(true));
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
    }
}
