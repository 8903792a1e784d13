pub mod allocator;

pub use allocator::{AllocatorConfig, BlockAllocator, REPLICA_SET_SIZE};
