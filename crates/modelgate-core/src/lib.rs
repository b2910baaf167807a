pub mod bootstrap;
pub mod error;
pub mod health;
pub mod pricing;
pub mod pump;
pub mod quota;
pub mod relay;
pub mod selector;
pub mod state;

pub use bootstrap::{Gateway, bootstrap};
pub use error::{RelayError, RelayResult};
pub use health::{HealthCheckConfig, HealthChecker};
pub use pricing::{Pricing, PricingService};
pub use pump::{PumpConfig, PumpExit, PumpOutcome};
pub use quota::{PreConsumeOutcome, QuotaConfig, QuotaService, UsageRecord};
pub use relay::{AuthedUser, RelayOrchestrator, RelayResponse};
pub use selector::{ChannelSelector, ChannelStats, SelectedChannel, SelectorConfig};
pub use state::AppState;
