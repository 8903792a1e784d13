pub mod cache;
pub mod codec;

pub use cache::{DEFAULT_NODE_CACHE_CAPACITY, NodeCache, ReplicaSetCache};
pub use codec::{BRANCH_TYPE_TAG, LEAF_TYPE_TAG, TreeNode};
