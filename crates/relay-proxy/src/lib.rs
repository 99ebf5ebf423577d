//! Server side of the chat relay.
//!
//! The proxy is the only component that holds upstream credentials. Each
//! request carries its own history; nothing is remembered between requests.

pub mod relay;
pub mod server;
pub mod upstream;

pub use relay::RelayProxy;
pub use server::{router, serve};
pub use upstream::{CompletionApi, CompletionRequest, HttpUpstream, UpstreamReply};
