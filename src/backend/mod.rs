pub mod cached_client;
pub mod client;
pub mod filter;
pub mod types;

pub use cached_client::CachedClient;
pub use client::BackendClient;
pub use filter::{Filter, QueryBuilder};
