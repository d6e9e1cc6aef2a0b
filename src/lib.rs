//! editor-bridge library
//!
//! A TCP bridge between a tick-driven host application and an external
//! process:
//! - Length-prefixed JSON framing and the message protocol
//! - A non-blocking forwarder the host drives from its own loop
//! - A connection manager that correlates concurrent requests by id
//! - A reconnection supervisor and an MCP server on top of it

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod forwarder;
pub mod host;
pub mod mcp;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;
