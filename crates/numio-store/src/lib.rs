pub mod cache;
pub mod db;

pub use cache::{CacheStore, CycleLockGuard};
pub use db::Store;
