pub mod adapter;
pub mod binding;
pub mod client;
pub mod errors;
pub mod headers;
pub mod http;
pub mod registry;

pub use adapter::{ChunkReceiver, ChunkSender, HealthProbe, ProviderAdapter, StreamItem};
pub use binding::ChannelBinding;
pub use client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
pub use errors::{AdapterError, AdapterErrorCode, AdapterResult};
pub use headers::{Headers, header_get};
pub use http::{
    ByteStream, HttpMethod, TransportErrorKind, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
pub use registry::{AdapterFactory, AdapterRegistry, RegistryError};
