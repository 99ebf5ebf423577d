//! Client side of the chat relay: a single-flight HTTP client for the proxy
//! and the session that stores each completed exchange.

pub mod client;
pub mod session;
pub mod transport;

pub use client::{RelayClient, RelayReply};
pub use session::ChatSession;
pub use transport::{HttpTransport, ProxyReply, ProxyTransport};
