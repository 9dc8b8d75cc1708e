//! Shared domain types, error model, and job configuration for the scoped
//! web crawler.
//!
//! This crate is the foundation depended on by `webcrawl-crawler` and the
//! CLI. It provides:
//! - [`CrawlError`] — the job-level error type
//! - Domain types: [`JobConfig`], [`KBConfig`], [`URLTask`], [`PageResult`],
//!   [`KBResult`], [`JobResult`], [`CoordinatorEvent`]
//! - Job configuration loading and validation ([`config::load_job_config`],
//!   [`config::validate`])

pub mod config;
pub mod error;
pub mod types;

pub use error::{CrawlError, Result};
pub use types::{
    CoordinatorEvent, CrawlMode, DepthStats, Failure, FailureExamples, FailurePhase, FailureType,
    JobConfig, JobResult, JobSummary, KBConfig, KBCounters, KBResult, KBState, PageResult,
    PageStatus, ProgressSnapshot, SkipReason, Timing, URLTask, ValidationReport,
};
