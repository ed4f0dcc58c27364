pub mod memory;
pub mod redis;
pub mod store;

pub use memory::MemoryStore;
pub use self::redis::{create_redis_client, RedisStore};
pub use store::{get_json, set_json, KeyValueStore, StoreError, StoreResult};
