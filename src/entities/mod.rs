pub mod feed_item;
pub mod shard;
pub mod user;
