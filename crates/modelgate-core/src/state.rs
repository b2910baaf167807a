//! Read-mostly process state shared across routers and background tasks.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use modelgate_common::GatewayConfig;
use modelgate_storage::{Storage, UserRow};

use crate::error::RelayResult;
use crate::relay::AuthedUser;

pub struct AppState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    users_by_key: ArcSwap<HashMap<String, UserRow>>,
}

impl AppState {
    pub fn new(config: GatewayConfig, users: Vec<UserRow>) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            users_by_key: ArcSwap::from_pointee(index_users(users)),
        }
    }

    /// Bearer key -> user. The auth layer proper (rate limits, key scopes)
    /// sits outside the relay; this is only the identity lookup.
    pub fn authenticate(&self, api_key: &str) -> Option<AuthedUser> {
        let users = self.users_by_key.load();
        let user = users.get(api_key)?;
        if !user.enabled {
            return None;
        }
        Some(AuthedUser {
            id: user.id,
            name: user.name.clone(),
            group: user.group_name.clone(),
        })
    }

    pub async fn reload_users(&self, storage: &Arc<dyn Storage>) -> RelayResult<()> {
        let snapshot = storage.load_snapshot().await?;
        self.users_by_key.store(Arc::new(index_users(snapshot.users)));
        Ok(())
    }

    pub fn apply_config(&self, config: GatewayConfig) {
        self.config.store(Arc::new(config));
    }
}

fn index_users(users: Vec<UserRow>) -> HashMap<String, UserRow> {
    users
        .into_iter()
        .filter(|user| !user.api_key.is_empty())
        .map(|user| (user.api_key.clone(), user))
        .collect()
}
