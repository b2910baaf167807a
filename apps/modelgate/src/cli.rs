use clap::Parser;

use modelgate_common::{GatewayConfigPatch, SelectionStrategy};

#[derive(Debug, Parser)]
#[command(name = "modelgate", about = "Multi-tenant LLM API gateway and relay")]
pub struct Cli {
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Database DSN; `mem:` runs fully in-memory.
    #[arg(long)]
    pub dsn: Option<String>,

    /// Plaintext admin key; stored and compared as a blake3 hash.
    #[arg(long, env = "MODELGATE_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// weight | priority | round_robin | lowest_latency | random
    #[arg(long)]
    pub strategy: Option<String>,

    #[arg(long)]
    pub max_attempts: Option<u32>,
}

impl Cli {
    pub fn into_patch(self) -> anyhow::Result<GatewayConfigPatch> {
        let selector_strategy = match self.strategy.as_deref() {
            Some(value) => Some(SelectionStrategy::parse(value)?),
            None => None,
        };
        Ok(GatewayConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            admin_key_hash: self
                .admin_key
                .map(|key| blake3::hash(key.as_bytes()).to_hex().to_string()),
            selector_strategy,
            selector_max_attempts: self.max_attempts,
            ..Default::default()
        })
    }
}
