//! mediaforge library crate.
//!
//! Media-generation orchestration and artifact cache engine: rotating
//! credential pools, SSRF-safe outbound fetching, retry with backoff,
//! provider adapters with primary/fallback failover, and a bounded,
//! deduplicating artifact store behind a token-protected admin surface.

pub mod cache;
pub mod config;
pub mod error;
pub mod failover;
pub mod keypool;
pub mod maintenance;
pub mod net;
pub mod providers;
pub mod refs;
pub mod web;
