use modelgate_protocol::chat::{
    ChatCompletionChunk, ChatMessage, ChatRole, ChunkChoice, ChunkDelta, ChunkObjectType,
    FinishReason, Usage,
};

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn synth_response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Split canonical messages into (leading system prompt, remaining turns).
/// Tool messages are folded into user turns for providers without a tool
/// role.
pub(crate) fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let mut system: Option<String> = None;
    let mut rest = Vec::with_capacity(messages.len());
    for (idx, message) in messages.iter().enumerate() {
        if idx == 0 && message.role == ChatRole::System {
            system = Some(message.content.clone());
            continue;
        }
        rest.push(message);
    }
    (system, rest)
}

pub(crate) fn text_chunk(
    id: &str,
    model: &str,
    created: i64,
    text: impl Into<String>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: ChunkObjectType::ChatCompletionChunk,
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(text.into()),
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

pub(crate) fn finish_chunk(
    id: &str,
    model: &str,
    created: i64,
    reason: FinishReason,
    usage: Option<Usage>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: ChunkObjectType::ChatCompletionChunk,
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(reason),
        }],
        usage,
    }
}
