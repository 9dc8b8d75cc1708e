//! Owns one Knowledge Base's isolated crawl state: its scope filter,
//! frontier, visited set, and results. Nothing outside this module ever
//! mutates them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc::Sender;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use webcrawl_shared::{
    CoordinatorEvent, DepthStats, JobConfig, KBConfig, KBCounters, KBResult, KBState, PageResult,
    PageStatus, ProgressSnapshot, Timing, URLTask,
};

use crate::fetch::Fetcher;
use crate::pool::{BatchProgress, WorkerPool};
use crate::scope::ScopeFilter;

/// The mutable state a KB owns across its whole run, shared only within this
/// module's own async task via `Arc<Mutex<..>>`.
struct KbState {
    scope: ScopeFilter,
    visited: HashSet<String>,
    depth_counts: HashMap<u32, usize>,
}

pub struct KBCrawler {
    kb: KBConfig,
    state: Arc<Mutex<KbState>>,
}

impl KBCrawler {
    pub fn new(kb: KBConfig, base_domain: &str, allow_subdomains: bool) -> Self {
        let prefixes = kb.derived_prefixes();
        let state = KbState {
            scope: ScopeFilter::new(base_domain, allow_subdomains, prefixes),
            visited: HashSet::new(),
            depth_counts: HashMap::new(),
        };
        Self {
            kb,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Run this KB's crawl to completion. `events` receives `MultiKbProgress`,
    /// `PageComplete`, `KbCompleted`, and `KbFailed` broadcasts if given.
    #[instrument(skip_all, fields(kb_id = %self.kb.kb_id, kb_name = %self.kb.name))]
    pub async fn run(
        self,
        fetcher: Arc<Fetcher>,
        worker_semaphore: Arc<Semaphore>,
        job: &JobConfig,
        events: Option<Sender<CoordinatorEvent>>,
    ) -> KBResult {
        let start = Instant::now();
        let max_depth = self.kb.effective_max_depth(job.clamped_max_depth());
        let kb_id = self.kb.kb_id.clone();
        let kb_name = self.kb.name.clone();

        let seeds = self.seed_frontier();
        if seeds.is_empty() {
            warn!("no entry URL was in scope; KB skipped");
            return self.finish(KBState::Skipped, Vec::new(), start, max_depth, &events);
        }

        self.send_snapshot(&events, KBState::Running, 0, max_depth, seeds.len(), 0);

        let pool = WorkerPool::new(
            fetcher,
            worker_semaphore,
            max_depth,
            job.mode,
            job.respect_robots,
            job.include_child_pages,
        );

        let scope_state = self.state.clone();
        let in_scope = {
            let scope_state = scope_state.clone();
            move |url: &str| scope_state.lock().unwrap().scope.is_in_scope(url)
        };

        let auto_discover = job.auto_discover_prefixes;
        let accept_state = self.state.clone();
        let accept = move |discovered: &str, parent_url: &str, depth: u32| {
            accept_discovered(&accept_state, auto_discover, discovered, parent_url, depth)
        };

        let progress_events = events.clone();
        let progress_kb_id = kb_id.clone();
        let progress_kb_name = kb_name.clone();
        let progress_state = self.state.clone();
        let mut total_processed = 0usize;
        let mut running_counters = KBCounters::default();
        let mut running_timing = Timing::default();
        let on_batch = move |batch: BatchProgress| {
            total_processed += batch.urls_processed_in_batch;
            running_counters.processed += batch.urls_processed_in_batch;
            running_counters.scraped += batch.scraped_in_batch;
            running_counters.crawled += batch.crawled_in_batch;
            running_counters.failed += batch.failed_in_batch;
            running_counters.queued = batch.queue_size;
            running_timing.total_ms += batch.batch_timing.total_ms;
            running_timing.crawl_ms += batch.batch_timing.crawl_ms;
            running_timing.scrape_ms += batch.batch_timing.scrape_ms;
            running_timing.time_before_failure_ms += batch.batch_timing.time_before_failure_ms;
            if let Some(tx) = &progress_events {
                let guard = progress_state.lock().unwrap();
                running_counters.discovered = guard.visited.len();
                running_counters.out_of_scope = guard.scope.out_of_scope_count();
                let _ = tx.try_send(CoordinatorEvent::MultiKbProgress {
                    snapshot: ProgressSnapshot {
                        kb_id: progress_kb_id.clone(),
                        kb_name: progress_kb_name.clone(),
                        state: KBState::Running,
                        current_depth: batch.current_depth,
                        max_depth,
                        queue_size: batch.queue_size,
                        urls_discovered: guard.visited.len(),
                        urls_processed: total_processed,
                        counters: running_counters.clone(),
                        timing_so_far: running_timing,
                    },
                });
            }
        };

        let pages = pool.run(seeds, in_scope, accept, on_batch).await;

        if let Some(tx) = &events {
            for page in &pages {
                let _ = tx.try_send(CoordinatorEvent::PageComplete {
                    kb_id: kb_id.clone(),
                    page: page.clone(),
                });
            }
        }

        self.finish(KBState::Completed, pages, start, max_depth, &events)
    }

    fn seed_frontier(&self) -> VecDeque<URLTask> {
        let mut seeds = VecDeque::new();
        let mut state = self.state.lock().unwrap();
        for entry in &self.kb.entry_urls {
            let decision = state.scope.check(entry, None);
            if !decision.allowed {
                continue;
            }
            let Some(normalized) = state.scope.normalize(entry, None) else {
                continue;
            };
            if !state.visited.insert(normalized.clone()) {
                continue;
            }
            *state.depth_counts.entry(1).or_insert(0) += 1;
            seeds.push_back(URLTask {
                url: normalized,
                parent_url: None,
                depth: 1,
                matched_prefix: decision.matched_prefix.unwrap_or_else(|| "/".to_string()),
            });
        }
        seeds
    }

    fn send_snapshot(
        &self,
        events: &Option<Sender<CoordinatorEvent>>,
        state: KBState,
        current_depth: u32,
        max_depth: u32,
        queue_size: usize,
        urls_processed: usize,
    ) {
        let Some(tx) = events else { return };
        let guard = self.state.lock().unwrap();
        let counters = KBCounters {
            discovered: guard.visited.len(),
            queued: queue_size,
            out_of_scope: guard.scope.out_of_scope_count(),
            ..Default::default()
        };
        let _ = tx.try_send(CoordinatorEvent::MultiKbProgress {
            snapshot: ProgressSnapshot {
                kb_id: self.kb.kb_id.clone(),
                kb_name: self.kb.name.clone(),
                state,
                current_depth,
                max_depth,
                queue_size,
                urls_discovered: guard.visited.len(),
                urls_processed,
                counters,
                timing_so_far: Timing::default(),
            },
        });
    }

    fn finish(
        self,
        state: KBState,
        pages: Vec<PageResult>,
        start: Instant,
        max_depth: u32,
        events: &Option<Sender<CoordinatorEvent>>,
    ) -> KBResult {
        let (counters, mut depth_stats, allowed_prefixes) = {
            let guard = self.state.lock().unwrap();
            let counters = count_pages(&pages, guard.scope.out_of_scope_count());
            let depth_stats: Vec<DepthStats> = guard
                .depth_counts
                .iter()
                .map(|(&depth, &urls_count)| DepthStats { depth, urls_count })
                .collect();
            (counters, depth_stats, guard.scope.prefixes().to_vec())
        };
        let timing = sum_timing(&pages);
        depth_stats.sort_by_key(|d| d.depth);

        info!(
            state = ?state,
            pages = pages.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "KB crawl finished"
        );

        if let Some(tx) = events {
            let current_depth = depth_stats.last().map(|d| d.depth).unwrap_or(0);
            let _ = tx.try_send(CoordinatorEvent::MultiKbProgress {
                snapshot: ProgressSnapshot {
                    kb_id: self.kb.kb_id.clone(),
                    kb_name: self.kb.name.clone(),
                    state,
                    current_depth,
                    max_depth,
                    queue_size: 0,
                    urls_discovered: counters.discovered,
                    urls_processed: counters.processed,
                    counters: counters.clone(),
                    timing_so_far: timing,
                },
            });
            match state {
                KBState::Completed => {
                    let _ = tx.try_send(CoordinatorEvent::KbCompleted {
                        kb_id: self.kb.kb_id.clone(),
                    });
                }
                KBState::Failed => {
                    let _ = tx.try_send(CoordinatorEvent::KbFailed {
                        kb_id: self.kb.kb_id.clone(),
                        reason: "cancelled".to_string(),
                    });
                }
                _ => {}
            }
        }

        KBResult {
            kb_id: self.kb.kb_id.clone(),
            kb_name: self.kb.name.clone(),
            entry_urls: self.kb.entry_urls.clone(),
            allowed_prefixes,
            state,
            pages,
            depth_stats,
            counters,
            timing,
            error: None,
        }
    }
}

fn accept_discovered(
    state: &Arc<Mutex<KbState>>,
    auto_discover: bool,
    discovered_url: &str,
    parent_url: &str,
    page_depth: u32,
) -> Option<(String, String)> {
    let mut guard = state.lock().unwrap();

    if auto_discover && page_depth <= 2 {
        let owned = discovered_url.to_string();
        guard.scope.discover_prefixes(std::slice::from_ref(&owned));
    }

    let decision = guard.scope.check(discovered_url, Some(parent_url));
    if !decision.allowed {
        return None;
    }
    let normalized = guard.scope.normalize(discovered_url, Some(parent_url))?;
    if !guard.visited.insert(normalized.clone()) {
        return None;
    }
    let child_depth = page_depth + 1;
    *guard.depth_counts.entry(child_depth).or_insert(0) += 1;
    Some((normalized, decision.matched_prefix?))
}

fn count_pages(pages: &[PageResult], out_of_scope: usize) -> KBCounters {
    let mut counters = KBCounters {
        discovered: pages.len(),
        processed: pages.len(),
        out_of_scope,
        ..Default::default()
    };
    for page in pages {
        match page.status {
            PageStatus::Scraped => counters.scraped += 1,
            PageStatus::Crawled => counters.crawled += 1,
            PageStatus::Error => counters.failed += 1,
            PageStatus::Skipped => {}
        }
    }
    counters
}

fn sum_timing(pages: &[PageResult]) -> Timing {
    pages.iter().fold(Timing::default(), |mut acc, p| {
        acc.total_ms += p.timing.total_ms;
        acc.crawl_ms += p.timing.crawl_ms;
        acc.scrape_ms += p.timing.scrape_ms;
        acc.time_before_failure_ms += p.timing.time_before_failure_ms;
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use webcrawl_shared::CrawlMode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job(base_domain: &str) -> JobConfig {
        JobConfig {
            base_domain: base_domain.to_string(),
            kbs: Vec::new(),
            mode: CrawlMode::CrawlAndScrape,
            max_depth: 3,
            worker_count: 4,
            parallel_kbs: 2,
            allow_subdomains: false,
            include_child_pages: true,
            respect_robots: false,
            auto_discover_prefixes: false,
        }
    }

    #[tokio::test]
    async fn skipped_when_no_entry_url_in_scope() {
        let kb = KBConfig {
            kb_id: "a".into(),
            name: "A".into(),
            entry_urls: vec!["https://other.test/".into()],
            is_active: true,
            max_depth: None,
        };
        let crawler = KBCrawler::new(kb, "ex.test", false);
        let fetcher = Arc::new(Fetcher::new().unwrap());
        let result = crawler
            .run(fetcher, Arc::new(Semaphore::new(2)), &job("ex.test"), None)
            .await;
        assert_eq!(result.state, KBState::Skipped);
        assert!(result.pages.is_empty());
    }

    #[tokio::test]
    async fn disjoint_kb_discovers_cross_kb_links_as_out_of_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>Scoped content for kb a, long enough to count</main><a href=\"/a/1\">1</a><a href=\"/b/1\">cross</a></body></html>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>Leaf page content long enough for scraping success</main></body></html>",
            ))
            .mount(&server)
            .await;

        let kb = KBConfig {
            kb_id: "a".into(),
            name: "A".into(),
            entry_urls: vec![format!("{}/a/", server.uri())],
            is_active: true,
            max_depth: None,
        };
        let host = url::Url::parse(&server.uri()).unwrap().host_str().unwrap().to_string();
        let crawler = KBCrawler::new(kb, &host, false);
        let fetcher = Arc::new(Fetcher::new().unwrap());
        let result = crawler
            .run(fetcher, Arc::new(Semaphore::new(4)), &job(&host), None)
            .await;

        assert_eq!(result.state, KBState::Completed);
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.counters.out_of_scope, 1);
    }

    #[tokio::test]
    async fn auto_discovery_fires_from_a_depth_two_page_not_just_depth_one() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>Root page content long enough to count as scraped</main><a href=\"/newsec/1\">next</a></body></html>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/newsec/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>Depth two page content long enough to be scraped</main><a href=\"/othersec/2\">next</a></body></html>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/othersec/2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>Depth three page content long enough to be scraped</main><a href=\"/deepsec/3\">next</a></body></html>",
            ))
            .mount(&server)
            .await;

        let kb = KBConfig {
            kb_id: "a".into(),
            name: "A".into(),
            entry_urls: vec![format!("{}/", server.uri())],
            is_active: true,
            max_depth: None,
        };
        let host = url::Url::parse(&server.uri()).unwrap().host_str().unwrap().to_string();
        let crawler = KBCrawler::new(kb, &host, false);
        let fetcher = Arc::new(Fetcher::new().unwrap());
        let mut run_job = job(&host);
        run_job.max_depth = 4;
        run_job.auto_discover_prefixes = true;
        let result = crawler
            .run(fetcher, Arc::new(Semaphore::new(4)), &run_job, None)
            .await;

        assert_eq!(result.state, KBState::Completed);
        let urls: Vec<&str> = result.pages.iter().map(|p| p.url.as_str()).collect();
        // /newsec was discovered from the depth-1 root page, /othersec from the
        // depth-2 page — both fire because discovery checks the *processed
        // page's* depth (<= 2), not the child's future depth.
        assert!(urls.iter().any(|u| u.contains("/newsec/1")));
        assert!(urls.iter().any(|u| u.contains("/othersec/2")));
        // /deepsec was only linked from the depth-3 page, past the cutoff, so
        // its prefix was never auto-discovered and the link stayed out of scope.
        assert!(!urls.iter().any(|u| u.contains("/deepsec")));
        assert!(result.counters.out_of_scope >= 1);
    }
}
