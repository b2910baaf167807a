use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_adapter::{
    AdapterRegistry, AdapterResult, ByteStream, ChannelBinding, ChunkReceiver, HealthProbe,
    HttpMethod, ProviderAdapter, RegistryError, UpstreamHttpRequest,
};
use modelgate_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};

struct NullAdapter {
    binding: ChannelBinding,
}

#[async_trait]
impl ProviderAdapter for NullAdapter {
    fn name(&self) -> &'static str {
        "null"
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn convert(&self, _request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest> {
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: "https://null.example/v1/chat/completions".to_string(),
            headers: Vec::new(),
            body: None,
            is_stream: false,
        })
    }

    fn parse_response(
        &self,
        _request: &ChatCompletionRequest,
        _body: &Bytes,
    ) -> AdapterResult<ChatCompletionResponse> {
        Err(modelgate_adapter::AdapterError::unsupported("parse"))
    }

    fn parse_stream(&self, _model: String, _body: ByteStream) -> ChunkReceiver {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        rx
    }

    fn health_probe(&self) -> AdapterResult<HealthProbe> {
        Err(modelgate_adapter::AdapterError::unsupported("health"))
    }
}

fn null_factory() -> modelgate_adapter::AdapterFactory {
    Arc::new(|binding: ChannelBinding| Arc::new(NullAdapter { binding }) as _)
}

#[test]
fn register_rejects_duplicates() {
    let registry = AdapterRegistry::new();
    registry.register("null", null_factory(), "1").unwrap();
    let err = registry.register("null", null_factory(), "2").unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyRegistered(name) if name == "null"));
    assert_eq!(registry.list().get("null").map(String::as_str), Some("1"));
}

#[test]
fn update_replaces_for_hot_reload() {
    let registry = AdapterRegistry::new();
    registry.register("null", null_factory(), "1").unwrap();
    registry.update("null", null_factory(), "2");
    assert_eq!(registry.list().get("null").map(String::as_str), Some("2"));
}

#[test]
fn create_binds_and_unknown_fails() {
    let registry = AdapterRegistry::new();
    registry.register("null", null_factory(), "1").unwrap();

    let adapter = registry
        .create("null", ChannelBinding::new(42, "key"))
        .unwrap();
    assert_eq!(adapter.binding().channel_id, 42);

    let err = registry
        .create("ghost", ChannelBinding::new(1, "key"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnknownAdapter(_)));
}

#[test]
fn concurrent_readers_do_not_block() {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register("null", null_factory(), "1").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100 {
                let adapter = registry
                    .create("null", ChannelBinding::new(i, "key"))
                    .unwrap();
                assert_eq!(adapter.name(), "null");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
