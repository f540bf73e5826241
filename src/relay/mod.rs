//! The relay core: admission, proxy rotation, forwarding and the listener

pub mod body;
pub mod forwarder;
pub mod handler;
pub mod headers;
pub mod middleware;
pub mod policy;
pub mod rotation;
pub mod server;
pub mod tls;

pub use forwarder::UpstreamForwarder;
pub use handler::{RelayHandler, RelayMode};
pub use headers::HeaderFilter;
pub use policy::PolicyGate;
pub use server::RelayServer;
