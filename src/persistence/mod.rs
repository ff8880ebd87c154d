// Persistence module - single-writer progress store with bounded retry

mod gateway;
mod retry;
mod store;

pub use gateway::PersistenceGateway;
pub use retry::RetryPolicy;
pub use store::{
    JsonFileStore, LevelProgress, MemoryStore, ProgressRecord, ProgressStats, SessionSummary,
    StorageEngine, StoreFault,
};
