pub mod cache;
pub mod client;
pub mod security;
pub mod transport;
pub mod utils;

pub use client::{ApiClient, ApiError, ApiRequest, ClientConfig, Resource};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
