// memproxy - Caching forward HTTP/1.x proxy

pub mod cache;
pub mod config;
pub mod http;
pub mod server;
pub mod utils;

// Re-export commonly used types
pub use utils::error::{ProxyError, Result};
