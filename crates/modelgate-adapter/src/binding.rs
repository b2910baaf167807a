use std::time::Duration;

/// One channel's view of its upstream: the registry binds a fresh adapter
/// instance to this at creation time.
#[derive(Debug, Clone)]
pub struct ChannelBinding {
    pub channel_id: i64,
    /// Overrides the adapter's default endpoint when set.
    pub base_url: Option<String>,
    pub api_key: String,
    /// Model the health checker probes with; falls back to the adapter's
    /// default probe when unset.
    pub test_model: Option<String>,
    pub request_timeout: Duration,
}

impl ChannelBinding {
    pub fn new(channel_id: i64, api_key: impl Into<String>) -> Self {
        Self {
            channel_id,
            base_url: None,
            api_key: api_key.into(),
            test_model: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
    }
}
