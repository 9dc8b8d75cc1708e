//! Level-synchronous BFS driver: a frontier partitioned by depth, drained one
//! full layer at a time, with bounded in-flight concurrency.
//!
//! The pool never starts a depth-`d+1` fetch until every depth-`d` task in
//! its batch has completed — the layer barrier from spec.md §4.5.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use webcrawl_shared::{CrawlMode, PageResult, PageStatus, Timing, URLTask};

use crate::fetch::Fetcher;

/// Progress reported to the caller after each depth batch completes. The
/// per-status counts and `batch_timing` cover only this batch — the caller
/// accumulates them into a running total, rather than this pool recomputing
/// totals from scratch (spec.md §4.12: progress snapshots need correct
/// running totals mid-crawl).
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProgress {
    pub current_depth: u32,
    pub urls_processed_in_batch: usize,
    pub queue_size: usize,
    pub scraped_in_batch: usize,
    pub crawled_in_batch: usize,
    pub failed_in_batch: usize,
    pub batch_timing: Timing,
}

/// Decision returned by the caller for one discovered URL: `Some` enqueues
/// it at the next depth under the given matched prefix, `None` drops it
/// (out of scope, or already visited).
pub type AcceptDecision = Option<(String, String)>;

pub struct WorkerPool {
    fetcher: Arc<Fetcher>,
    worker_semaphore: Arc<Semaphore>,
    max_depth: u32,
    mode: CrawlMode,
    respect_robots: bool,
    include_child_pages: bool,
}

impl WorkerPool {
    pub fn new(
        fetcher: Arc<Fetcher>,
        worker_semaphore: Arc<Semaphore>,
        max_depth: u32,
        mode: CrawlMode,
        respect_robots: bool,
        include_child_pages: bool,
    ) -> Self {
        Self {
            fetcher,
            worker_semaphore,
            max_depth,
            mode,
            respect_robots,
            include_child_pages,
        }
    }

    /// Drive the BFS to completion (or until `frontier` is empty).
    ///
    /// `in_scope` re-validates redirect targets against the owning KB's
    /// scope, read-only. `accept` is invoked once per discovered URL after
    /// its parent batch finishes, synchronously, so it may freely mutate the
    /// caller's visited set and scope filter (auto-discovered prefixes must
    /// take effect before the rest of that batch's children are filtered).
    /// Its `u32` argument is the depth of the page the URL was discovered
    /// on, not the depth the child will be enqueued at.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut frontier: VecDeque<URLTask>,
        in_scope: impl Fn(&str) -> bool + Send + Sync,
        mut accept: impl FnMut(&str, &str, u32) -> AcceptDecision,
        mut on_batch: impl FnMut(BatchProgress),
    ) -> Vec<PageResult> {
        let mut results = Vec::new();
        let scrape_only = !self.mode.expands_frontier();

        while let Some(depth) = frontier.front().map(|t| t.depth) {
            let batch: Vec<URLTask> = {
                let mut drained = Vec::new();
                while let Some(front) = frontier.front() {
                    if front.depth != depth {
                        break;
                    }
                    drained.push(frontier.pop_front().unwrap());
                }
                drained
            };

            debug!(depth, batch_size = batch.len(), "draining BFS layer");

            let mut in_flight = FuturesUnordered::new();
            for task in batch {
                let fetcher = self.fetcher.clone();
                let semaphore = self.worker_semaphore.clone();
                let mode = self.mode;
                let respect_robots = self.respect_robots;
                let include_child_pages = self.include_child_pages;
                let in_scope = &in_scope;
                in_flight.push(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    fetcher
                        .fetch(&task, mode, respect_robots, include_child_pages, in_scope)
                        .await
                });
            }

            let mut batch_results = Vec::new();
            while let Some(outcome) = in_flight.next().await {
                batch_results.push(outcome);
            }

            for outcome in &batch_results {
                if scrape_only || outcome.page.depth >= self.max_depth {
                    continue;
                }
                for discovered in &outcome.discovered_urls {
                    if let Some((normalized, matched_prefix)) =
                        accept(discovered, &outcome.page.url, outcome.page.depth)
                    {
                        frontier.push_back(URLTask {
                            url: normalized,
                            parent_url: Some(outcome.page.url.clone()),
                            depth: outcome.page.depth + 1,
                            matched_prefix,
                        });
                    }
                }
            }

            let processed = batch_results.len();
            let mut scraped_in_batch = 0;
            let mut crawled_in_batch = 0;
            let mut failed_in_batch = 0;
            let mut batch_timing = Timing::default();
            for outcome in &batch_results {
                match outcome.page.status {
                    PageStatus::Scraped => scraped_in_batch += 1,
                    PageStatus::Crawled => crawled_in_batch += 1,
                    PageStatus::Error => failed_in_batch += 1,
                    PageStatus::Skipped => {}
                }
                batch_timing.total_ms += outcome.page.timing.total_ms;
                batch_timing.crawl_ms += outcome.page.timing.crawl_ms;
                batch_timing.scrape_ms += outcome.page.timing.scrape_ms;
                batch_timing.time_before_failure_ms += outcome.page.timing.time_before_failure_ms;
            }
            results.extend(batch_results.into_iter().map(|o| o.page));

            on_batch(BatchProgress {
                current_depth: depth,
                urls_processed_in_batch: processed,
                queue_size: frontier.len(),
                scraped_in_batch,
                crawled_in_batch,
                failed_in_batch,
                batch_timing,
            });

            if scrape_only {
                break;
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webcrawl_shared::PageStatus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn seed(url: String) -> VecDeque<URLTask> {
        let mut f = VecDeque::new();
        f.push_back(URLTask {
            url,
            parent_url: None,
            depth: 1,
            matched_prefix: "/".to_string(),
        });
        f
    }

    #[tokio::test]
    async fn layer_barrier_holds_for_a_three_hop_chain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        for (from, to) in [("/", "/a"), ("/a", "/b"), ("/b", "/c")] {
            Mock::given(method("GET"))
                .and(path(from))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                    "<html><body><main>enough content to count as scraped for this page truly</main><a href=\"{to}\">next</a></body></html>"
                )))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/c"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>final page content long enough to be scraped successfully here</main></body></html>",
            ))
            .mount(&server)
            .await;

        let fetcher = Arc::new(Fetcher::new().unwrap());
        let pool = WorkerPool::new(
            fetcher,
            Arc::new(Semaphore::new(4)),
            2,
            CrawlMode::CrawlAndScrape,
            true,
            true,
        );

        let mut depths_seen = Vec::new();
        let results = pool
            .run(
                seed(server.uri()),
                |_| true,
                |discovered, parent, depth| Some((discovered.to_string(), format!("from {parent} at {depth}"))),
                |progress| depths_seen.push(progress.current_depth),
            )
            .await;

        // max_depth = 2: only depth-1 (/) and depth-2 (/a) are fetched.
        let urls: Vec<&str> = results.iter().map(|p| p.url.as_str()).collect();
        assert!(urls.iter().any(|u| u.ends_with('/') || u.ends_with(&server.uri())));
        assert!(urls.iter().any(|u| u.ends_with("/a")));
        assert!(!urls.iter().any(|u| u.ends_with("/b")));
        assert_eq!(depths_seen, vec![1, 2]);
        assert!(results.iter().all(|p| p.status == PageStatus::Scraped));
    }

    #[tokio::test]
    async fn scrape_only_processes_single_batch_without_expansion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>home page content long enough to be scraped here today</main><a href=\"/a\">a</a></body></html>",
            ))
            .mount(&server)
            .await;

        let fetcher = Arc::new(Fetcher::new().unwrap());
        let pool = WorkerPool::new(
            fetcher,
            Arc::new(Semaphore::new(4)),
            3,
            CrawlMode::ScrapeOnly,
            true,
            true,
        );

        let mut batches = 0;
        let results = pool
            .run(
                seed(server.uri()),
                |_| true,
                |_, _, _| panic!("scrape-only must never call accept"),
                |_| batches += 1,
            )
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(batches, 1);
    }
}
