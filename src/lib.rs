//! CORS Relay - public CORS-bypass relay
//!
//! Fetches an arbitrary upstream URL on behalf of a browser and streams the
//! response back with `Access-Control-Allow-Origin: *` attached.
//!
//! ## Features
//!
//! - URL and header admission policy
//! - Proxy pool rotation with per-proxy quota and cooldown (or round-robin)
//! - Global burst limiter when running without proxies
//! - Per-client token-bucket throttling
//! - Streamed forwarding with a hard response size cap
//! - Load shedding based on scheduler lag
//! - Optional HTTPS listener

pub mod config;
pub mod error;
pub mod models;
pub mod relay;
pub mod services;

pub use config::Config;
pub use error::{RelayError, Result};
