use time::OffsetDateTime;

/// One configured upstream binding as loaded at bootstrap. Stats live in
/// memory only (selector-owned); this row is the durable part.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    pub adapter: String,
    pub base_url: Option<String>,
    pub api_keys: Vec<String>,
    /// Exact names and `prefix*` patterns.
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub test_model: Option<String>,
    pub priority: i32,
    pub weight: i32,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ChannelRow {
    /// Eligibility check: model supported (exact or prefix) and group
    /// permitted. An empty groups list means unrestricted.
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                model.starts_with(prefix)
            } else {
                pattern == model
            }
        })
    }

    pub fn permits_group(&self, group: &str) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| g == group)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingRow {
    pub id: i64,
    pub model_name: String,
    pub group_name: String,
    pub quota_type: QuotaType,
    pub input_rate: f64,
    pub completion_multiplier: f64,
    pub group_multiplier: f64,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaType {
    Token,
    PerCall,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Token => "token",
            QuotaType::PerCall => "per_call",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "per_call" => QuotaType::PerCall,
            _ => QuotaType::Token,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub group_name: String,
    pub balance: i64,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub channels: Vec<ChannelRow>,
    pub pricing: Vec<PricingRow>,
    pub users: Vec<UserRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(models: &[&str], groups: &[&str]) -> ChannelRow {
        let now = OffsetDateTime::UNIX_EPOCH;
        ChannelRow {
            id: 1,
            name: "c".to_string(),
            adapter: "openai".to_string(),
            base_url: None,
            api_keys: vec!["k".to_string()],
            models: models.iter().map(|s| s.to_string()).collect(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            test_model: None,
            priority: 0,
            weight: 1,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn model_matching_exact_and_prefix() {
        let row = channel(&["gpt-3.5-turbo", "gpt-4*"], &[]);
        assert!(row.supports_model("gpt-3.5-turbo"));
        assert!(row.supports_model("gpt-4o-mini"));
        assert!(!row.supports_model("gpt-3.5-turbo-16k"));
        assert!(!row.supports_model("claude-3-haiku"));
    }

    #[test]
    fn empty_groups_means_unrestricted() {
        assert!(channel(&["m"], &[]).permits_group("vip"));
        let restricted = channel(&["m"], &["default"]);
        assert!(restricted.permits_group("default"));
        assert!(!restricted.permits_group("vip"));
    }
}
