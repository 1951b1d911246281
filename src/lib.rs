//! Compass DNS
//!
//! A forwarding DNS resolver with a local override database and an
//! in-memory response cache.
//!
//! # Features
//!
//! * DNS packet parsing and serialization over UDP
//! * Local override rules with wildcard and parent-domain matching
//! * Blackhole rules that sink unwanted domains
//! * TTL-bounded response cache with LRU eviction
//! * Upstream relaying with per-query transaction ID correlation
//!
//! # Architecture
//!
//! All functionality lives under the `dns` module; the `compass` binary
//! wires configuration, logging and signal handling around it.

/// DNS server implementation and protocol handling
pub mod dns;
