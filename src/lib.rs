// Library interface for the AEGIS log ingestion node
// Exposes the components so the binary and integration tests share them

pub mod config;
pub mod detector;
pub mod error;
pub mod export;
pub mod gatekeeper;
pub mod handlers;
pub mod lock_utils;
pub mod log_buffer;
pub mod log_file;
pub mod params;
pub mod rate_limiter;
pub mod server;
pub mod store;
