use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::adapter::ProviderAdapter;
use crate::binding::ChannelBinding;

pub type AdapterFactory = Arc<dyn Fn(ChannelBinding) -> Arc<dyn ProviderAdapter> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyRegistered(String),
    UnknownAdapter(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(name) => {
                write!(f, "adapter already registered: {name}")
            }
            RegistryError::UnknownAdapter(name) => write!(f, "unknown adapter: {name}"),
        }
    }
}

impl Error for RegistryError {}

struct RegistryEntry {
    factory: AdapterFactory,
    version: String,
}

/// Process-wide name -> factory map. Reads vastly outnumber writes (writes
/// only happen at startup and on hot-reload), so a plain RwLock over the
/// map is enough.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        factory: AdapterFactory,
        version: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        entries.insert(
            name,
            RegistryEntry {
                factory,
                version: version.into(),
            },
        );
        Ok(())
    }

    /// Replace (or install) a factory atomically; running adapters keep the
    /// instance they were created with.
    pub fn update(
        &self,
        name: impl Into<String>,
        factory: AdapterFactory,
        version: impl Into<String>,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            name.into(),
            RegistryEntry {
                factory,
                version: version.into(),
            },
        );
    }

    /// Build a fresh adapter bound to one channel's configuration.
    pub fn create(
        &self,
        name: &str,
        binding: ChannelBinding,
    ) -> Result<Arc<dyn ProviderAdapter>, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAdapter(name.to_string()))?;
        Ok((entry.factory)(binding))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn list(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, entry)| (name.clone(), entry.version.clone()))
            .collect()
    }
}
