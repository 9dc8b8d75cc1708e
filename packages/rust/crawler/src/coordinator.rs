//! Runs every active KB in a job concurrently under two shared semaphores,
//! aggregates progress, and broadcasts lifecycle events.

use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use webcrawl_shared::{
    config, CoordinatorEvent, FailureExamples, JobConfig, JobResult, JobSummary, KBResult,
    KBState, Result, Timing, ValidationReport,
};

use crate::fetch::Fetcher;
use crate::kb::KBCrawler;

/// Capacity of the job's event channel. Progress events are best-effort —
/// a slow or absent consumer drops events rather than stalling the crawl
/// (see the `try_send` calls below).
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Validate a job configuration without running it — the library-native
/// equivalent of a dry-run `/api/kb/validate` endpoint.
pub fn validate_job(job: &JobConfig) -> ValidationReport {
    let errors = config::validate_errors(job);
    let warnings = config::detect_overlaps(job);
    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

pub struct MultiKBCoordinator {
    job: JobConfig,
    job_id: String,
    fetcher: Arc<Fetcher>,
    worker_semaphore: Arc<Semaphore>,
    kb_semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    events_tx: Sender<CoordinatorEvent>,
    events_rx: Option<Receiver<CoordinatorEvent>>,
}

impl MultiKBCoordinator {
    /// Construct a coordinator for `job`, performing the hard validation
    /// checks from spec.md §4.7 up front.
    pub fn new(job: JobConfig) -> Result<Self> {
        config::validate(&job)?;
        let fetcher = Arc::new(Fetcher::new()?);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            worker_semaphore: Arc::new(Semaphore::new(job.clamped_worker_count())),
            kb_semaphore: Arc::new(Semaphore::new(job.clamped_parallel_kbs())),
            job_id: Uuid::now_v7().to_string(),
            job,
            fetcher,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// Take the event receiver. Only the first call returns `Some`; events
    /// broadcast before this is called (or before the channel fills up) are
    /// still queued, but a full channel drops further events rather than
    /// blocking the crawl.
    pub fn take_events(&mut self) -> Option<Receiver<CoordinatorEvent>> {
        self.events_rx.take()
    }

    /// A cloneable handle to cancel this job from another task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation of this job (spec.md §5).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Spawn this job onto its own task and hand back its event receiver
    /// alongside the `JoinHandle` — the library-native equivalent of a
    /// WebSocket layer subscribing to job progress before it starts.
    pub fn run_with_progress(mut self) -> (JoinHandle<JobResult>, Receiver<CoordinatorEvent>) {
        let events_rx = self.events_rx.take().expect("events receiver already taken");
        let handle = tokio::spawn(self.run());
        (handle, events_rx)
    }

    #[instrument(skip_all, fields(job_id = %self.job_id, base_domain = %self.job.base_domain))]
    pub async fn run(self) -> JobResult {
        let total_start = std::time::Instant::now();
        let _ = self.events_tx.try_send(CoordinatorEvent::JobStarted {
            job_id: self.job_id.clone(),
        });

        info!(kb_count = self.job.active_kbs().count(), "starting job");

        let mut handles = Vec::new();
        for kb in self.job.active_kbs().cloned() {
            let fetcher = self.fetcher.clone();
            let worker_semaphore = self.worker_semaphore.clone();
            let kb_semaphore = self.kb_semaphore.clone();
            let job = self.job.clone();
            let events_tx = self.events_tx.clone();
            let cancel = self.cancel.clone();
            let kb_id = kb.kb_id.clone();
            let handle_kb_id = kb_id.clone();

            handles.push((handle_kb_id, tokio::spawn(async move {
                let _permit = kb_semaphore.acquire_owned().await.expect("semaphore closed");
                let crawler = KBCrawler::new(kb, &job.base_domain, job.allow_subdomains);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(kb_id, "KB cancelled");
                        failed_result(&kb_id, "cancelled")
                    }
                    result = crawler.run(fetcher, worker_semaphore, &job, Some(events_tx)) => result,
                }
            })));
        }

        let mut kb_results = Vec::new();
        for (kb_id, handle) in handles {
            match handle.await {
                Ok(result) => kb_results.push(result),
                Err(join_err) => {
                    warn!(kb_id, error = %join_err, "KB task panicked");
                    kb_results.push(failed_result(&kb_id, join_err.to_string()));
                }
            }
        }

        let summary = summarize(&kb_results);
        let total_timing = sum_timing(&kb_results);
        let cancelled = self.cancel.is_cancelled();

        let result = JobResult {
            job_id: self.job_id.clone(),
            base_domain: self.job.base_domain.clone(),
            mode: self.job.mode,
            kb_results,
            summary,
            total_timing,
            completed_at: chrono::Utc::now(),
        };

        if cancelled {
            let _ = self.events_tx.try_send(CoordinatorEvent::JobFailed {
                reason: "cancelled".to_string(),
            });
        } else {
            let _ = self.events_tx.try_send(CoordinatorEvent::JobCompleted {
                result: Box::new(result.clone()),
            });
        }

        info!(
            elapsed_ms = total_start.elapsed().as_millis() as u64,
            pages_failed = result.summary.pages_failed,
            "job finished"
        );

        result
    }
}

fn failed_result(kb_id: &str, error: impl Into<String>) -> KBResult {
    KBResult {
        kb_id: kb_id.to_string(),
        kb_name: String::new(),
        entry_urls: Vec::new(),
        allowed_prefixes: Vec::new(),
        state: KBState::Failed,
        pages: Vec::new(),
        depth_stats: Vec::new(),
        counters: Default::default(),
        timing: Timing::default(),
        error: Some(error.into()),
    }
}

fn summarize(kb_results: &[KBResult]) -> JobSummary {
    let mut summary = JobSummary::default();
    for kb in kb_results {
        summary.urls_out_of_scope += kb.counters.out_of_scope;
        for page in &kb.pages {
            if !page.failure.is_failure() {
                continue;
            }
            summary.pages_failed += 1;
            match page.failure.phase {
                Some(webcrawl_shared::FailurePhase::Crawl) => summary.crawl_failures += 1,
                Some(webcrawl_shared::FailurePhase::Scrape) => summary.scrape_failures += 1,
                _ => {}
            }
            let key = page
                .failure
                .kind
                .map(|k| format!("{k:?}"))
                .unwrap_or_else(|| "unknown".to_string());
            summary
                .failure_breakdown
                .entry(key)
                .or_insert_with(FailureExamples::default)
                .record(&page.url);
        }
    }
    summary
}

fn sum_timing(kb_results: &[KBResult]) -> Timing {
    kb_results.iter().fold(Timing::default(), |mut acc, kb| {
        acc.total_ms += kb.timing.total_ms;
        acc.crawl_ms += kb.timing.crawl_ms;
        acc.scrape_ms += kb.timing.scrape_ms;
        acc.time_before_failure_ms += kb.timing.time_before_failure_ms;
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use webcrawl_shared::{CrawlMode, KBConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn kb(id: &str, name: &str, url: &str) -> KBConfig {
        KBConfig {
            kb_id: id.into(),
            name: name.into(),
            entry_urls: vec![url.into()],
            is_active: true,
            max_depth: None,
        }
    }

    #[test]
    fn validate_job_reports_errors_and_warnings() {
        let job = JobConfig {
            base_domain: "ex.test".into(),
            kbs: vec![],
            mode: CrawlMode::CrawlAndScrape,
            max_depth: 3,
            worker_count: 4,
            parallel_kbs: 2,
            allow_subdomains: false,
            include_child_pages: true,
            respect_robots: true,
            auto_discover_prefixes: false,
        };
        let report = validate_job(&job);
        assert!(!report.valid);
        assert!(!report.errors.is_empty());
    }

    #[tokio::test]
    async fn two_disjoint_kbs_run_independently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>KB A seed content long enough to count as scraped</main></body></html>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><main>KB B seed content long enough to count as scraped</main></body></html>",
            ))
            .mount(&server)
            .await;

        let host = url::Url::parse(&server.uri()).unwrap();
        let authority = format!(
            "{}:{}",
            host.host_str().unwrap(),
            host.port().unwrap()
        );

        let job = JobConfig {
            base_domain: authority.clone(),
            kbs: vec![
                kb("a", "A", &format!("{}/a/", server.uri())),
                kb("b", "B", &format!("{}/b/", server.uri())),
            ],
            mode: CrawlMode::CrawlAndScrape,
            max_depth: 2,
            worker_count: 4,
            parallel_kbs: 2,
            allow_subdomains: false,
            include_child_pages: true,
            respect_robots: true,
            auto_discover_prefixes: false,
        };

        let coordinator = MultiKBCoordinator::new(job).unwrap();
        let result = coordinator.run().await;

        assert_eq!(result.kb_results.len(), 2);
        assert!(result.kb_results.iter().all(|kb| kb.state == KBState::Completed));
    }
}
