//! Core domain types for the scoped web crawler.
//!
//! These types are intentionally plain data: the crawl engine (in
//! `webcrawl-crawler`) mutates them through single-owner components, never
//! shares them across tasks as interior-mutable state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CrawlMode
// ---------------------------------------------------------------------------

/// How a Knowledge Base's pages are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    /// Discover links but never extract title/headings/main text.
    CrawlOnly,
    /// Process exactly the seed URLs, no link expansion.
    ScrapeOnly,
    /// Discover links and extract content.
    CrawlAndScrape,
}

impl CrawlMode {
    /// Whether this mode expands the frontier by following discovered links.
    pub fn expands_frontier(self) -> bool {
        !matches!(self, CrawlMode::ScrapeOnly)
    }

    /// Whether pages processed under this mode extract content at all.
    pub fn scrapes_content(self) -> bool {
        !matches!(self, CrawlMode::CrawlOnly)
    }
}

// ---------------------------------------------------------------------------
// KBConfig / JobConfig
// ---------------------------------------------------------------------------

/// One Knowledge Base within a job: an independently-scoped crawl subproject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KBConfig {
    /// Stable identifier, unique within the job.
    pub kb_id: String,
    /// Display name, unique (case-insensitively) within the job.
    pub name: String,
    /// Nonempty ordered set of entry URLs.
    pub entry_urls: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Per-KB override of `JobConfig::max_depth`.
    #[serde(default)]
    pub max_depth: Option<u32>,
}

impl KBConfig {
    /// The effective max depth for this KB, given the job default.
    pub fn effective_max_depth(&self, job_default: u32) -> u32 {
        self.max_depth.unwrap_or(job_default)
    }

    /// The sorted, deduplicated list of normalized path prefixes derived from
    /// `entry_urls`: one per entry URL (its path, stripped of trailing
    /// slash, lowercased, leading slash guaranteed; empty becomes `"/"`).
    pub fn derived_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .entry_urls
            .iter()
            .filter_map(|u| url::Url::parse(u).ok())
            .map(|parsed| normalize_prefix(parsed.path()))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        prefixes
    }
}

fn normalize_prefix(path: &str) -> String {
    let mut p = path.to_ascii_lowercase();
    if p.len() > 1 {
        while p.ends_with('/') {
            p.pop();
        }
    }
    if p.is_empty() {
        p = "/".to_string();
    }
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    p
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> u32 {
    3
}
fn default_worker_count() -> u32 {
    4
}
fn default_parallel_kbs() -> u32 {
    2
}

/// Configuration for one crawl job, spanning one or more Knowledge Bases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub base_domain: String,
    pub kbs: Vec<KBConfig>,
    #[serde(default = "default_mode")]
    pub mode: CrawlMode,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    #[serde(default = "default_parallel_kbs")]
    pub parallel_kbs: u32,
    #[serde(default)]
    pub allow_subdomains: bool,
    #[serde(default = "default_true")]
    pub include_child_pages: bool,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default)]
    pub auto_discover_prefixes: bool,
}

fn default_mode() -> CrawlMode {
    CrawlMode::CrawlAndScrape
}

impl JobConfig {
    /// `worker_count` clamped to its `[2,10]` bound.
    pub fn clamped_worker_count(&self) -> usize {
        self.worker_count.clamp(2, 10) as usize
    }

    /// `parallel_kbs` clamped to its `[1,5]` bound.
    pub fn clamped_parallel_kbs(&self) -> usize {
        self.parallel_kbs.clamp(1, 5) as usize
    }

    /// `max_depth` clamped to its `[1,10]` bound.
    pub fn clamped_max_depth(&self) -> u32 {
        self.max_depth.clamp(1, 10)
    }

    pub fn active_kbs(&self) -> impl Iterator<Item = &KBConfig> {
        self.kbs.iter().filter(|kb| kb.is_active)
    }
}

// ---------------------------------------------------------------------------
// URLTask
// ---------------------------------------------------------------------------

/// A frontier entry: a URL awaiting fetch at a given BFS depth.
#[derive(Debug, Clone)]
pub struct URLTask {
    pub url: String,
    pub parent_url: Option<String>,
    /// BFS layer this task was discovered in; entry URLs are depth 1.
    pub depth: u32,
    pub matched_prefix: String,
}

// ---------------------------------------------------------------------------
// PageResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Scraped,
    Crawled,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ChildPagesDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    None,
    Crawl,
    Scrape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Timeout,
    DnsError,
    SslError,
    ConnectionError,
    Http4xx,
    Http5xx,
    RobotsBlocked,
    RedirectLoop,
    EmptyContent,
    JsBlocked,
    ParseError,
    SelectorMismatch,
    Unknown,
}

impl FailureType {
    /// Whether the fetcher's retry loop should retry on this failure type.
    pub fn is_retryable(self, http_status: Option<u16>) -> bool {
        match self {
            FailureType::Timeout
            | FailureType::Http5xx
            | FailureType::ConnectionError
            | FailureType::SslError
            | FailureType::DnsError => true,
            FailureType::Http4xx => http_status == Some(429),
            _ => false,
        }
    }
}

/// A page-level failure record. Page failures are data, never propagated as
/// Rust errors — see `webcrawl_shared::error::CrawlError` for job-level
/// failures that do abort execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Failure {
    pub phase: Option<FailurePhase>,
    #[serde(rename = "type")]
    pub kind: Option<FailureType>,
    pub reason: Option<String>,
    pub http_status: Option<u16>,
}

impl Failure {
    pub fn none() -> Self {
        Self {
            phase: Some(FailurePhase::None),
            kind: None,
            reason: None,
            http_status: None,
        }
    }

    pub fn crawl(kind: FailureType, reason: impl Into<String>, http_status: Option<u16>) -> Self {
        Self {
            phase: Some(FailurePhase::Crawl),
            kind: Some(kind),
            reason: Some(reason.into()),
            http_status,
        }
    }

    pub fn scrape(kind: FailureType, reason: impl Into<String>) -> Self {
        Self {
            phase: Some(FailurePhase::Scrape),
            kind: Some(kind),
            reason: Some(reason.into()),
            http_status: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self.phase, None | Some(FailurePhase::None))
    }
}

/// Per-page timing breakdown, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Timing {
    pub total_ms: u64,
    pub crawl_ms: u64,
    pub scrape_ms: u64,
    pub time_before_failure_ms: u64,
}

/// The result of processing one `URLTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub title: Option<String>,
    #[serde(default)]
    pub headings: Vec<String>,
    pub main_text: Option<String>,
    pub links_found: usize,
    pub status: PageStatus,
    pub skip_reason: Option<SkipReason>,
    pub timing: Timing,
    pub failure: Failure,
}

// ---------------------------------------------------------------------------
// KBResult / JobResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KBState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Count of URLs discovered at a given BFS depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthStats {
    pub depth: u32,
    pub urls_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KBCounters {
    pub discovered: usize,
    pub processed: usize,
    pub out_of_scope: usize,
    pub scraped: usize,
    pub crawled: usize,
    pub failed: usize,
    pub queued: usize,
    pub in_flight: usize,
}

/// A snapshot of one KB's progress, emitted at seeding, after each depth
/// batch, and on terminal transition. Copy-on-emit: the coordinator only
/// ever reads these, never the KBCrawler's live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub kb_id: String,
    pub kb_name: String,
    pub state: KBState,
    pub current_depth: u32,
    pub max_depth: u32,
    pub queue_size: usize,
    pub urls_discovered: usize,
    pub urls_processed: usize,
    pub counters: KBCounters,
    pub timing_so_far: Timing,
}

/// The outcome of crawling one Knowledge Base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KBResult {
    pub kb_id: String,
    pub kb_name: String,
    pub entry_urls: Vec<String>,
    pub allowed_prefixes: Vec<String>,
    pub state: KBState,
    pub pages: Vec<PageResult>,
    pub depth_stats: Vec<DepthStats>,
    pub counters: KBCounters,
    pub timing: Timing,
    pub error: Option<String>,
}

/// Up to 3 example URLs for one failure type, for user-visible breakdowns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureExamples {
    pub count: usize,
    pub example_urls: Vec<String>,
}

impl FailureExamples {
    pub fn record(&mut self, url: &str) {
        self.count += 1;
        if self.example_urls.len() < 3 {
            self.example_urls.push(url.to_string());
        }
    }
}

/// Aggregate counters across all KBs in a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub pages_failed: usize,
    pub urls_out_of_scope: usize,
    pub crawl_failures: usize,
    pub scrape_failures: usize,
    pub failure_breakdown: HashMap<String, FailureExamples>,
}

/// The final result of a multi-KB crawl job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub base_domain: String,
    pub mode: CrawlMode,
    pub kb_results: Vec<KBResult>,
    pub summary: JobSummary,
    pub total_timing: Timing,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Validation report (dry-run `/api/kb/validate` equivalent)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Coordinator events (the bounded event channel from spec.md §9)
// ---------------------------------------------------------------------------

/// Events broadcast by `MultiKBCoordinator` on state transitions. A
/// WebSocket/REST layer built on this engine would serialize these directly
/// using the variant name as the JSON `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    JobStarted { job_id: String },
    MultiKbProgress { snapshot: ProgressSnapshot },
    PageComplete { kb_id: String, page: PageResult },
    KbCompleted { kb_id: String },
    KbFailed { kb_id: String, reason: String },
    JobCompleted { result: Box<JobResult> },
    JobFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_prefixes_normalize_and_dedup() {
        let kb = KBConfig {
            kb_id: "kb1".into(),
            name: "KB One".into(),
            entry_urls: vec![
                "https://ex.test/Admissions-Aid/".into(),
                "https://ex.test/admissions-aid".into(),
                "https://ex.test/".into(),
            ],
            is_active: true,
            max_depth: None,
        };
        let prefixes = kb.derived_prefixes();
        assert_eq!(prefixes, vec!["/".to_string(), "/admissions-aid".to_string()]);
    }

    #[test]
    fn failure_none_is_not_a_failure() {
        assert!(!Failure::none().is_failure());
        assert!(Failure::crawl(FailureType::Timeout, "timed out", None).is_failure());
    }

    #[test]
    fn http_429_is_retryable_other_4xx_is_not() {
        assert!(FailureType::Http4xx.is_retryable(Some(429)));
        assert!(!FailureType::Http4xx.is_retryable(Some(404)));
        assert!(FailureType::Http5xx.is_retryable(Some(503)));
    }

    #[test]
    fn job_config_clamps_bounds() {
        let job = JobConfig {
            base_domain: "ex.test".into(),
            kbs: vec![],
            mode: CrawlMode::CrawlAndScrape,
            max_depth: 99,
            worker_count: 1,
            parallel_kbs: 50,
            allow_subdomains: false,
            include_child_pages: true,
            respect_robots: true,
            auto_discover_prefixes: false,
        };
        assert_eq!(job.clamped_max_depth(), 10);
        assert_eq!(job.clamped_worker_count(), 2);
        assert_eq!(job.clamped_parallel_kbs(), 5);
    }
}
