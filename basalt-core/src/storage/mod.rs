pub mod block_store;
pub mod log_store;
pub mod manager_state;

pub use block_store::BlockStore;
pub use log_store::LogStore;
pub use manager_state::ManagerStateStore;
