//! Forwarding DNS resolver
//!
//! This module provides the complete resolver implementation:
//! * DNS packet parsing and serialization
//! * A local override database with precedence rules and blackholing
//! * A TTL-bounded, LRU-evicting response cache
//! * An upstream relay with transaction ID correlation
//! * The UDP server loop tying the pieces together
//!
//! # Module Structure
//!
//! * `buffer` - Low-level packet buffer operations
//! * `protocol` - DNS protocol definitions and packet handling
//! * `overrides` - Local override rule database
//! * `cache` - DNS response caching with TTL and LRU eviction
//! * `relay` - Upstream forwarding with response correlation
//! * `server` - The UDP server loop and worker pool
//! * `context` - Server configuration and shared state
//! * `config` - Configuration file loading
//! * `logging` - Log backend with console and file sinks

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS response caching with TTL support and LRU eviction
pub mod cache;

/// Configuration file loading
pub mod config;

/// Server configuration and shared context
pub mod context;

/// Log backend writing to stderr and an optional log file
pub mod logging;

/// Local override rule database
pub mod overrides;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Upstream relay for unresolved queries
pub mod relay;

/// UDP DNS server implementation
pub mod server;
