pub mod db;
pub mod keys;
pub mod kv;

pub use db::Database;
pub use kv::{KvStore, MemoryKv};
