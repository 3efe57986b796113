//! HTTP reverse proxy that rewrites request paths onto an upstream prefix
//! and rebases absolute URIs in text response bodies while they stream.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod rewrite;
pub mod transport;

pub use config::{Args, ProxyConfig};
pub use error::{ConfigError, ProxyError};
pub use proxy::{app, AppState};
