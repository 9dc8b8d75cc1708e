//! Fetches one URL: robots check, rate-limit wait, HTTP GET with retry and
//! backoff, link and content extraction, precise per-phase timing.

use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use reqwest::{Client, StatusCode};
use tracing::instrument;
use url::Url;

use webcrawl_shared::{CrawlMode, Failure, FailureType, PageResult, PageStatus, SkipReason, Timing, URLTask};

use crate::extract::{self, ContentQuality};
use crate::ratelimit::RateLimiter;
use crate::robots::{self, RobotsCache};

const USER_AGENTS: [&str; 6] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Crawler/1.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Crawler/1.0",
    "Mozilla/5.0 (X11; Linux x86_64) Crawler/1.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Crawler/1.0",
    "Mozilla/5.0 (Android 14; Mobile) Crawler/1.0",
    "Mozilla/5.0 (compatible; ScopedCrawler/1.0; +https://ex.test/bot)",
];
const MAX_RETRIES: u32 = 3;
const MAX_REDIRECTS: usize = 5;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of fetching one task: its `PageResult` plus any links discovered
/// (empty unless the fetch reached a parsed 200 response).
pub struct FetchOutcome {
    pub page: PageResult,
    pub discovered_urls: Vec<String>,
}

/// Shared fetcher: owns the HTTP client, the robots cache, and the rate
/// limiter. One instance is shared by every KB in a job, since politeness
/// is a property of the origin, not the KB.
pub struct Fetcher {
    client: Client,
    robots: RobotsCache,
    ratelimit: RateLimiter,
}

impl Fetcher {
    pub fn new() -> webcrawl_shared::Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| webcrawl_shared::CrawlError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            robots: RobotsCache::new(client.clone()),
            ratelimit: RateLimiter::new(Duration::from_millis(500)),
            client,
        })
    }

    /// Fetch `task`. `in_scope` decides whether a redirect target stays
    /// within the owning KB's scope (each hop must re-pass it).
    #[instrument(skip(self, in_scope), fields(url = %task.url, depth = task.depth))]
    pub async fn fetch(
        &self,
        task: &URLTask,
        mode: CrawlMode,
        respect_robots: bool,
        include_child_pages: bool,
        in_scope: impl Fn(&str) -> bool,
    ) -> FetchOutcome {
        let total_start = Instant::now();
        let skip_scrape = !include_child_pages && task.depth >= 2;

        if respect_robots {
            let ua = pick_user_agent();
            if !self.robots.allowed(&task.url, ua).await {
                return FetchOutcome {
                    page: error_page(
                        task,
                        Failure::crawl(FailureType::RobotsBlocked, "disallowed by robots.txt", None),
                        Timing {
                            total_ms: elapsed_ms(total_start),
                            time_before_failure_ms: elapsed_ms(total_start),
                            ..Default::default()
                        },
                    ),
                    discovered_urls: Vec::new(),
                };
            }
        }

        if let Some(origin) = robots::origin_of(&task.url) {
            if let Some(delay) = self.robots.crawl_delay(&origin).await {
                self.ratelimit.set_delay(&origin, Duration::from_secs_f64(delay)).await;
            }
            self.ratelimit.acquire(&origin).await;
        }

        self.fetch_with_retries(task, mode, skip_scrape, total_start, in_scope).await
    }

    async fn fetch_with_retries(
        &self,
        task: &URLTask,
        mode: CrawlMode,
        skip_scrape: bool,
        total_start: Instant,
        in_scope: impl Fn(&str) -> bool,
    ) -> FetchOutcome {
        let mut crawl_ms_total: u64 = 0;
        let mut backoff = Duration::from_secs(1);
        let mut last_failure = Failure::none();

        for attempt in 0..=MAX_RETRIES {
            let round_trip_start = Instant::now();
            let result = self.get_following_redirects(&task.url, &in_scope).await;
            crawl_ms_total += elapsed_ms(round_trip_start);

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if let Some(origin) = robots::origin_of(&task.url) {
                            self.ratelimit.record_success(&origin).await;
                        }
                        return self
                            .on_success(task, mode, skip_scrape, response, crawl_ms_total, total_start)
                            .await;
                    }

                    let http_status = status.as_u16();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_failure = Failure::crawl(FailureType::Http4xx, "rate limited", Some(http_status));
                        if let Some(origin) = robots::origin_of(&task.url) {
                            self.ratelimit.record_429(&origin).await;
                        }
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(backoff * 2).await;
                            backoff *= 2;
                            continue;
                        }
                        break;
                    } else if status.is_server_error() {
                        last_failure = Failure::crawl(FailureType::Http5xx, status.to_string(), Some(http_status));
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                            continue;
                        }
                        break;
                    } else {
                        last_failure = Failure::crawl(FailureType::Http4xx, status.to_string(), Some(http_status));
                        break;
                    }
                }
                Err(FetchError::OutOfScope) => {
                    last_failure = Failure::crawl(
                        FailureType::ConnectionError,
                        "redirect_out_of_scope",
                        None,
                    );
                    break;
                }
                Err(FetchError::RedirectLoop) => {
                    last_failure = Failure::crawl(FailureType::RedirectLoop, "redirect loop detected", None);
                    break;
                }
                Err(FetchError::Reqwest(e)) => {
                    if e.is_timeout() {
                        last_failure = Failure::crawl(FailureType::Timeout, e.to_string(), None);
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                            continue;
                        }
                        break;
                    }
                    let kind = classify_connection_error(&e.to_string());
                    last_failure = Failure::crawl(kind, e.to_string(), None);
                    if kind.is_retryable(None) && attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    break;
                }
            }
        }

        FetchOutcome {
            page: error_page(
                task,
                last_failure,
                Timing {
                    total_ms: elapsed_ms(total_start),
                    crawl_ms: crawl_ms_total,
                    scrape_ms: 0,
                    time_before_failure_ms: crawl_ms_total,
                },
            ),
            discovered_urls: Vec::new(),
        }
    }

    async fn get_following_redirects(
        &self,
        start_url: &str,
        in_scope: &impl Fn(&str) -> bool,
    ) -> Result<reqwest::Response, FetchError> {
        let mut current = start_url.to_string();
        let mut seen = std::collections::HashSet::new();
        let ua = pick_user_agent();

        for _ in 0..=MAX_REDIRECTS {
            if !seen.insert(current.clone()) {
                return Err(FetchError::RedirectLoop);
            }

            let response = self
                .client
                .get(&current)
                .header("User-Agent", ua)
                .header("Accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
                .send()
                .await
                .map_err(FetchError::Reqwest)?;

            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Ok(response);
                };
                let Ok(next) = Url::parse(&current).and_then(|base| base.join(location)) else {
                    return Ok(response);
                };
                let next_str = next.to_string();
                if !in_scope(&next_str) {
                    return Err(FetchError::OutOfScope);
                }
                current = next_str;
                continue;
            }

            return Ok(response);
        }

        Err(FetchError::RedirectLoop)
    }

    async fn on_success(
        &self,
        task: &URLTask,
        mode: CrawlMode,
        skip_scrape: bool,
        response: reqwest::Response,
        crawl_ms: u64,
        total_start: Instant,
    ) -> FetchOutcome {
        let base_url = match Url::parse(response.url().as_str()) {
            Ok(u) => u,
            Err(_) => match Url::parse(&task.url) {
                Ok(u) => u,
                Err(_) => {
                    return FetchOutcome {
                        page: error_page(
                            task,
                            Failure::crawl(FailureType::ParseError, "malformed URL", None),
                            Timing {
                                total_ms: elapsed_ms(total_start),
                                crawl_ms,
                                time_before_failure_ms: crawl_ms,
                                ..Default::default()
                            },
                        ),
                        discovered_urls: Vec::new(),
                    };
                }
            },
        };

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                return FetchOutcome {
                    page: error_page(
                        task,
                        Failure::scrape(FailureType::ParseError, e.to_string()),
                        Timing {
                            total_ms: elapsed_ms(total_start),
                            crawl_ms,
                            time_before_failure_ms: crawl_ms,
                            ..Default::default()
                        },
                    ),
                    discovered_urls: Vec::new(),
                };
            }
        };

        let scrape_start = Instant::now();
        let doc = scraper::Html::parse_document(&body);
        let discovered_urls = extract::extract_links(&doc, &base_url);

        if skip_scrape {
            return FetchOutcome {
                page: PageResult {
                    url: task.url.clone(),
                    parent_url: task.parent_url.clone(),
                    depth: task.depth,
                    title: None,
                    headings: Vec::new(),
                    main_text: None,
                    links_found: discovered_urls.len(),
                    status: PageStatus::Skipped,
                    skip_reason: Some(SkipReason::ChildPagesDisabled),
                    timing: Timing {
                        total_ms: elapsed_ms(total_start),
                        crawl_ms,
                        scrape_ms: 0,
                        time_before_failure_ms: 0,
                    },
                    failure: Failure::none(),
                },
                discovered_urls,
            };
        }

        if !mode.scrapes_content() {
            return FetchOutcome {
                page: PageResult {
                    url: task.url.clone(),
                    parent_url: task.parent_url.clone(),
                    depth: task.depth,
                    title: None,
                    headings: Vec::new(),
                    main_text: None,
                    links_found: discovered_urls.len(),
                    status: PageStatus::Crawled,
                    skip_reason: None,
                    timing: Timing {
                        total_ms: elapsed_ms(total_start),
                        crawl_ms,
                        scrape_ms: elapsed_ms(scrape_start),
                        time_before_failure_ms: 0,
                    },
                    failure: Failure::none(),
                },
                discovered_urls,
            };
        }

        let extracted = extract::extract_content(&doc);
        let quality = extract::classify_quality(&doc, extracted.main_text.as_deref());
        let scrape_ms = elapsed_ms(scrape_start);

        match quality {
            ContentQuality::Ok => FetchOutcome {
                page: PageResult {
                    url: task.url.clone(),
                    parent_url: task.parent_url.clone(),
                    depth: task.depth,
                    title: extracted.title,
                    headings: extracted.headings,
                    main_text: extracted.main_text,
                    links_found: discovered_urls.len(),
                    status: PageStatus::Scraped,
                    skip_reason: None,
                    timing: Timing {
                        total_ms: elapsed_ms(total_start),
                        crawl_ms,
                        scrape_ms,
                        time_before_failure_ms: 0,
                    },
                    failure: Failure::none(),
                },
                discovered_urls,
            },
            ContentQuality::EmptyContent | ContentQuality::JsBlocked => {
                let kind = if quality == ContentQuality::JsBlocked {
                    FailureType::JsBlocked
                } else {
                    FailureType::EmptyContent
                };
                FetchOutcome {
                    page: error_page(
                        task,
                        Failure::scrape(kind, "extracted content too short"),
                        Timing {
                            total_ms: elapsed_ms(total_start),
                            crawl_ms,
                            scrape_ms,
                            time_before_failure_ms: crawl_ms + scrape_ms,
                        },
                    ),
                    discovered_urls,
                }
            }
        }
    }
}

enum FetchError {
    OutOfScope,
    RedirectLoop,
    Reqwest(reqwest::Error),
}

fn classify_connection_error(message: &str) -> FailureType {
    let lower = message.to_ascii_lowercase();
    if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
        FailureType::SslError
    } else if lower.contains("dns") || lower.contains("resolve") {
        FailureType::DnsError
    } else {
        FailureType::ConnectionError
    }
}

fn pick_user_agent() -> &'static str {
    USER_AGENTS.choose(&mut rand::rng()).copied().unwrap_or(USER_AGENTS[0])
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn error_page(task: &URLTask, failure: Failure, timing: Timing) -> PageResult {
    PageResult {
        url: task.url.clone(),
        parent_url: task.parent_url.clone(),
        depth: task.depth,
        title: None,
        headings: Vec::new(),
        main_text: None,
        links_found: 0,
        status: PageStatus::Error,
        skip_reason: None,
        timing,
        failure,
    }
}
