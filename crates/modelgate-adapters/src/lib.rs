//! Built-in provider adapters.
//!
//! One module per upstream family; OpenAI-compatible vendors (DeepSeek,
//! Moonshot, MiniMax, and generic passthrough endpoints) share the OpenAI
//! adapter with different base-URL presets.

use std::sync::Arc;

use modelgate_adapter::{AdapterRegistry, ChannelBinding, ProviderAdapter};

pub mod baidu;
pub mod claude;
pub mod gemini;
pub mod openai;
pub mod qwen;
mod util;

pub const BUILTIN_VERSION: &str = "1";

/// Install the built-in adapter factories. Called once at bootstrap; custom
/// factories can be layered on afterwards through `registry.update`.
pub fn install_builtin(registry: &AdapterRegistry) {
    let presets: &[(&'static str, &'static str)] = &[
        ("openai", openai::OPENAI_BASE_URL),
        ("deepseek", openai::DEEPSEEK_BASE_URL),
        ("moonshot", openai::MOONSHOT_BASE_URL),
        ("minimax", openai::MINIMAX_BASE_URL),
        ("openai_compatible", openai::OPENAI_BASE_URL),
    ];
    for (name, base) in presets {
        let name = *name;
        let base = *base;
        registry.update(
            name,
            Arc::new(move |binding: ChannelBinding| {
                Arc::new(openai::OpenAiAdapter::new(name, base, binding))
                    as Arc<dyn ProviderAdapter>
            }),
            BUILTIN_VERSION,
        );
    }

    registry.update(
        "claude",
        Arc::new(|binding: ChannelBinding| {
            Arc::new(claude::ClaudeAdapter::new(binding)) as Arc<dyn ProviderAdapter>
        }),
        BUILTIN_VERSION,
    );
    registry.update(
        "gemini",
        Arc::new(|binding: ChannelBinding| {
            Arc::new(gemini::GeminiAdapter::new(binding)) as Arc<dyn ProviderAdapter>
        }),
        BUILTIN_VERSION,
    );
    registry.update(
        "baidu",
        Arc::new(|binding: ChannelBinding| {
            Arc::new(baidu::BaiduAdapter::new(binding)) as Arc<dyn ProviderAdapter>
        }),
        BUILTIN_VERSION,
    );
    registry.update(
        "qwen",
        Arc::new(|binding: ChannelBinding| {
            Arc::new(qwen::QwenAdapter::new(binding)) as Arc<dyn ProviderAdapter>
        }),
        BUILTIN_VERSION,
    );
}

/// Fresh registry holding only the built-ins.
pub fn builtin_registry() -> AdapterRegistry {
    let registry = AdapterRegistry::new();
    install_builtin(&registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_installed() {
        let registry = builtin_registry();
        for name in [
            "openai",
            "deepseek",
            "moonshot",
            "minimax",
            "openai_compatible",
            "claude",
            "gemini",
            "baidu",
            "qwen",
        ] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
    }

    #[test]
    fn create_binds_channel_config() {
        let registry = builtin_registry();
        let binding = ChannelBinding::new(7, "sk-test").with_base_url("https://proxy.example");
        let adapter = registry.create("openai", binding).unwrap();
        assert_eq!(adapter.name(), "openai");
        assert_eq!(adapter.binding().channel_id, 7);
    }
}
