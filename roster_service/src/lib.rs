pub mod entitys;
pub mod manager;
pub mod shard_router;
pub mod store;
