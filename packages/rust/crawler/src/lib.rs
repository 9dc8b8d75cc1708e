//! Scoped crawl execution engine.
//!
//! This crate provides:
//! - [`scope`] — domain and path-prefix scope checking ([`scope::ScopeFilter`])
//! - [`robots`] — per-origin robots.txt cache ([`robots::RobotsCache`])
//! - [`ratelimit`] — per-origin request spacing ([`ratelimit::RateLimiter`])
//! - [`extract`] — link and main-content extraction from parsed HTML
//! - [`fetch`] — fetches one URL end to end ([`fetch::Fetcher`])
//! - [`pool`] — level-synchronous BFS over a frontier ([`pool::WorkerPool`])
//! - [`kb`] — one Knowledge Base's isolated crawl state ([`kb::KBCrawler`])
//! - [`coordinator`] — runs a whole job's KBs concurrently
//!   ([`coordinator::MultiKBCoordinator`], [`coordinator::validate_job`])

pub mod coordinator;
pub mod extract;
pub mod fetch;
pub mod kb;
pub mod pool;
pub mod ratelimit;
pub mod robots;
pub mod scope;

pub use coordinator::{validate_job, MultiKBCoordinator};
pub use fetch::Fetcher;
pub use kb::KBCrawler;
pub use pool::WorkerPool;
pub use ratelimit::RateLimiter;
pub use robots::RobotsCache;
pub use scope::ScopeFilter;
