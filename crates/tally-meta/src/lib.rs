pub mod etcd;
pub mod file;
pub mod memory;
pub mod stored_map;
pub mod types;

pub use etcd::EtcdMetaStore;
pub use file::FileMetaStore;
pub use memory::MemoryMetaStore;
pub use stored_map::{StoreError, StoredMap};
pub use types::{MetaStore, MetaStoreExt};
