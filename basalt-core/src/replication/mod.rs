pub mod entry;
pub mod value_store;

pub use entry::{LogEntry, LogPayload};
pub use value_store::{LOG_BUNDLE_SIZE, RETRY_QUEUE_LIMIT, ReplicatedValueStore, ValueStoreConfig};
