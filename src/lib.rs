//! epprelay: an EPP (RFC 5730/5734) reverse proxy.
//!
//! Sits between EPP clients and a backend EPP server, relaying
//! length-prefixed protocol frames over long-lived TCP connections without
//! interpreting the XML payloads. Each accepted client is paired with a
//! fresh backend connection; the proxy performs the backend greeting/login
//! handshake itself, then forwards frames verbatim in both directions
//! until either side closes.
//!
//! Layering, leaves first:
//! - [`codec`]: the length-prefixed wire format, pure bytes
//! - [`xml`] / [`frames`]: the hello/login/logout documents the proxy
//!   originates itself
//! - [`channel`]: per-connection read/write state machine over a
//!   non-blocking stream
//! - [`connector`]: backend connect + handshake
//! - [`relay`]: the client/backend session pairing
//! - [`server`]: the mio event loop tying it all together

pub mod channel;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod frames;
pub mod relay;
pub mod server;
pub mod xml;

pub use error::{Error, Result};
