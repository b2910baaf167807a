//! Token counting for billing.
//!
//! OpenAI-family models get BPE-exact counts through tiktoken; every other
//! family gets a character heuristic. Both sides present the same interface
//! so the relay never branches on family.

use std::sync::{Arc, OnceLock};

use tiktoken_rs::CoreBPE;

use modelgate_protocol::chat::ChatMessage;

/// Per-message framing overhead of the OpenAI chat format, plus the
/// reply-priming constant added once per request.
const TOKENS_PER_MESSAGE: u64 = 3;
const TOKENS_PER_NAME: u64 = 1;
const REPLY_PRIMING_TOKENS: u64 = 3;

#[derive(Debug, Clone)]
pub enum TokenCounter {
    /// cl100k_base byte-pair encoding.
    Bpe(Arc<CoreBPE>),
    /// ~4 latin characters or ~2/3 CJK character per token.
    Heuristic,
}

impl TokenCounter {
    pub fn count(&self, text: &str) -> u64 {
        match self {
            TokenCounter::Bpe(bpe) => bpe.encode_ordinary(text).len() as u64,
            TokenCounter::Heuristic => heuristic_count(text),
        }
    }

    pub fn count_messages(&self, messages: &[ChatMessage]) -> u64 {
        let mut total = REPLY_PRIMING_TOKENS;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            total += self.count(message.role.as_str());
            total += self.count(&message.content);
            if let Some(name) = &message.name {
                total += TOKENS_PER_NAME + self.count(name);
            }
        }
        total
    }
}

/// Pick the counter for a model name.
pub fn tokenizer_for(model: &str) -> TokenCounter {
    if is_openai_family(model)
        && let Some(bpe) = cl100k()
    {
        return TokenCounter::Bpe(bpe);
    }
    TokenCounter::Heuristic
}

/// Stateful counter fed by the stream pump as deltas arrive.
///
/// For BPE models the raw text is accumulated and encoded once at
/// `finalize`, so the result equals the non-streaming count of the
/// concatenation; token boundaries do not align with chunk boundaries.
#[derive(Debug)]
pub struct StreamingCounter {
    counter: TokenCounter,
    buffer: String,
    running: u64,
}

impl StreamingCounter {
    pub fn add_chunk(&mut self, text: &str) {
        match &self.counter {
            TokenCounter::Bpe(_) => self.buffer.push_str(text),
            TokenCounter::Heuristic => self.running += heuristic_count(text),
        }
    }

    /// Cheap running estimate; exact only for the heuristic counter.
    pub fn current(&self) -> u64 {
        match &self.counter {
            TokenCounter::Bpe(_) => heuristic_count(&self.buffer),
            TokenCounter::Heuristic => self.running,
        }
    }

    pub fn finalize(self) -> u64 {
        match &self.counter {
            TokenCounter::Bpe(_) => self.counter.count(&self.buffer),
            TokenCounter::Heuristic => self.running,
        }
    }
}

pub fn streaming_counter(model: &str) -> StreamingCounter {
    StreamingCounter {
        counter: tokenizer_for(model),
        buffer: String::new(),
        running: 0,
    }
}

pub fn is_openai_family(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.starts_with("gpt-")
        || model.starts_with("chatgpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("text-davinci")
}

fn cl100k() -> Option<Arc<CoreBPE>> {
    static ENCODER: OnceLock<Option<Arc<CoreBPE>>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(err) => {
                tracing::warn!(error = %err, "cl100k_base init failed, falling back to heuristic");
                None
            }
        })
        .clone()
}

fn heuristic_count(text: &str) -> u64 {
    // Quarter-token units so CJK (6/4) and latin (1/4) stay in integers.
    let mut quarters: u64 = 0;
    for ch in text.chars() {
        quarters += if is_cjk(ch) { 6 } else { 1 };
    }
    quarters.div_ceil(4)
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{F900}'..='\u{FAFF}'
            | '\u{3040}'..='\u{30FF}'
            | '\u{AC00}'..='\u{D7AF}')
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_protocol::chat::ChatRole;

    #[test]
    fn family_detection() {
        assert!(is_openai_family("gpt-3.5-turbo"));
        assert!(is_openai_family("gpt-4o-mini"));
        assert!(is_openai_family("o1-preview"));
        assert!(!is_openai_family("claude-3-haiku"));
        assert!(!is_openai_family("qwen-turbo"));
    }

    #[test]
    fn heuristic_latin_and_cjk() {
        // 8 latin chars -> 2 tokens.
        assert_eq!(heuristic_count("abcdefgh"), 2);
        // 2 CJK chars -> 12 quarters -> 3 tokens.
        assert_eq!(heuristic_count("你好"), 3);
        assert_eq!(heuristic_count(""), 0);
    }

    #[test]
    fn bpe_count_is_plausible() {
        let counter = tokenizer_for("gpt-3.5-turbo");
        let n = counter.count("Hello, world!");
        assert!(n >= 2 && n <= 6, "unexpected count {n}");
    }

    #[test]
    fn message_overhead_applied() {
        let counter = tokenizer_for("gpt-3.5-turbo");
        let messages = vec![ChatMessage::new(ChatRole::User, "Hi")];
        let counted = counter.count_messages(&messages);
        let bare = counter.count("user") + counter.count("Hi");
        assert_eq!(counted, bare + TOKENS_PER_MESSAGE + REPLY_PRIMING_TOKENS);
    }

    #[test]
    fn streaming_finalize_matches_whole_count() {
        let whole = tokenizer_for("gpt-4o").count("The quick brown fox jumps over the lazy dog");
        let mut streaming = streaming_counter("gpt-4o");
        streaming.add_chunk("The quick brown ");
        streaming.add_chunk("fox jumps over ");
        streaming.add_chunk("the lazy dog");
        assert_eq!(streaming.finalize(), whole);
    }

    #[test]
    fn concat_is_approximately_additive() {
        let counter = tokenizer_for("unknown-model");
        let a = "some latin text ";
        let b = "和一些中文";
        let joined = format!("{a}{b}");
        let sum = counter.count(a) + counter.count(b);
        let whole = counter.count(&joined);
        assert!(sum.abs_diff(whole) <= 1);
    }
}
