//! Concrete `LmTransport` against an Anthropic-Messages-API-shaped backend
//! (spec §4.6), grounded in `crates/providers/anthropic`.

mod config;
mod transport;
mod wire;

pub use config::AnthropicConfig;
pub use transport::AnthropicTransport;
