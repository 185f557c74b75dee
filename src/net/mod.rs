//! Outbound network plumbing: SSRF-guarded fetching and retry policy.

pub mod fetch;
pub mod retry;

pub use fetch::{FetchedPayload, NetworkConfig, SafeFetcher};
pub use retry::{execute, RetryPolicy};
