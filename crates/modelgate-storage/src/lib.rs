pub mod entities;
pub mod mem;
pub mod seaorm;
pub mod sink;
pub mod snapshot;
pub mod storage;

pub use mem::MemStorage;
pub use seaorm::SeaOrmStorage;
pub use sink::{UsageLogQueue, UsageLogQueueConfig};
pub use snapshot::{ChannelRow, PricingRow, QuotaType, StorageSnapshot, UserRow};
pub use storage::{
    ChannelUpsert, PreConsumedRecord, PricingUpsert, Storage, StorageError, StorageResult,
    UsageLogInsert,
};

use std::sync::Arc;

/// Connect by DSN; `mem:` selects the in-memory backend.
pub async fn connect(dsn: &str) -> StorageResult<Arc<dyn Storage>> {
    if dsn == "mem:" || dsn == "mem://" {
        return Ok(Arc::new(MemStorage::new()));
    }
    Ok(Arc::new(SeaOrmStorage::connect(dsn).await?))
}
