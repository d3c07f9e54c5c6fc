pub mod child;
pub mod config;
pub mod gateway;
pub mod jsonrpc;
pub mod session;
pub mod sse;

pub use config::{load_config, validate_config, Config, ResponseMode};
pub use gateway::{serve, serve_with_listener, ServeOutcome};
