//! # Remote Connection Server Core
//!
//! This crate implements a remote connection server: it accepts client
//! connection requests over a WebSocket/JSON transport, authenticates them
//! through a pluggable chain of authenticators, tracks live connections
//! with strict lifecycle invariants, periodically evicts unhealthy
//! connections, filters inbound payloads against a deserialization
//! allow-list, and orchestrates auxiliary listeners alongside the main
//! service.
//!
//! ## Features
//! - At-most-one connection per client id, enforced under a single connect
//!   critical section
//! - Connection limit with idempotent reconnects
//! - Shared and client-type-specific authenticators, run in order
//! - Pattern, allow-list and dry-run deserialization filters
//! - Recurring connection maintenance with a runtime-adjustable interval
//! - Auxiliary servers started synchronously before the server is up
//! - Admin/observability endpoint with prometheus metrics
//!
//! ## Dependencies
//! - `tokio` for the asynchronous runtime
//! - `tokio-tungstenite` for the WebSocket transport
//! - `tokio-rustls` for TLS support
//! - `tracing` for logging

pub mod config;
pub mod server;
pub mod utils;
