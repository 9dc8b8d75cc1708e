//! Per-origin robots.txt cache with fail-open semantics.
//!
//! On first request per origin, `/robots.txt` is fetched under a per-origin
//! lock so concurrent callers for the same origin single-flight onto one
//! fetch; any other origin proceeds independently. Any error — non-200,
//! timeout, connection failure — installs a permissive "allow all" policy
//! rather than blocking the crawl.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use robotstxt::DefaultMatcher;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ROBOTS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RobotsEntry {
    body: String,
    crawl_delay: Option<f64>,
    allow_all: bool,
}

impl RobotsEntry {
    fn allow_all() -> Self {
        Self {
            body: String::new(),
            crawl_delay: None,
            allow_all: true,
        }
    }
}

/// Caches one parsed robots policy per origin (`scheme://host[:port]`).
pub struct RobotsCache {
    client: Client,
    origins: Mutex<HashMap<String, Arc<Mutex<Option<RobotsEntry>>>>>,
}

impl RobotsCache {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            origins: Mutex::new(HashMap::new()),
        }
    }

    async fn entry_lock(&self, origin: &str) -> Arc<Mutex<Option<RobotsEntry>>> {
        let mut origins = self.origins.lock().await;
        origins
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn load(&self, origin: &str) -> RobotsEntry {
        let lock = self.entry_lock(origin).await;
        let mut guard = lock.lock().await;
        if let Some(entry) = guard.as_ref() {
            return entry.clone();
        }

        let entry = self.fetch(origin).await;
        *guard = Some(entry.clone());
        entry
    }

    async fn fetch(&self, origin: &str) -> RobotsEntry {
        let url = format!("{origin}/robots.txt");
        let response = self
            .client
            .get(&url)
            .timeout(ROBOTS_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => {
                    let crawl_delay = parse_crawl_delay(&body);
                    debug!(origin, crawl_delay, "loaded robots.txt");
                    RobotsEntry {
                        body,
                        crawl_delay,
                        allow_all: false,
                    }
                }
                Err(e) => {
                    warn!(origin, error = %e, "robots.txt body read failed, failing open");
                    RobotsEntry::allow_all()
                }
            },
            Ok(resp) => {
                debug!(origin, status = %resp.status(), "robots.txt non-200, failing open");
                RobotsEntry::allow_all()
            }
            Err(e) => {
                warn!(origin, error = %e, "robots.txt fetch failed, failing open");
                RobotsEntry::allow_all()
            }
        }
    }

    /// Whether `user_agent` may fetch `url` per the origin's robots policy.
    pub async fn allowed(&self, url: &str, user_agent: &str) -> bool {
        let Some(origin) = origin_of(url) else {
            return true;
        };
        let entry = self.load(&origin).await;
        if entry.allow_all {
            return true;
        }
        DefaultMatcher::default().one_agent_allowed_by_robots(&entry.body, user_agent, url)
    }

    /// The `Crawl-delay` declared for `origin`, in seconds, if any.
    pub async fn crawl_delay(&self, origin: &str) -> Option<f64> {
        let entry = self.load(origin).await;
        entry.crawl_delay
    }
}

fn parse_crawl_delay(body: &str) -> Option<f64> {
    body.lines()
        .filter_map(|line| {
            let lower = line.to_ascii_lowercase();
            let rest = lower.strip_prefix("crawl-delay:")?;
            rest.trim().parse::<f64>().ok()
        })
        .next()
}

/// `scheme://host[:port]` for `url`, or `None` if it cannot be parsed.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn crawl_delay_parses_case_insensitively() {
        let body = "User-agent: *\nCrawl-delay: 2.5\nDisallow: /private\n";
        assert_eq!(parse_crawl_delay(body), Some(2.5));
    }

    #[test]
    fn origin_ignores_path_and_query() {
        assert_eq!(
            origin_of("https://ex.test:8080/a/b?x=1"),
            Some("https://ex.test:8080".to_string())
        );
    }

    #[tokio::test]
    async fn fails_open_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cache = RobotsCache::new(Client::new());
        let allowed = cache
            .allowed(&format!("{}/private", server.uri()), "TestBot")
            .await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn disallow_rule_is_honored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "User-agent: *\nDisallow: /private\n",
            ))
            .mount(&server)
            .await;

        let cache = RobotsCache::new(Client::new());
        assert!(
            !cache
                .allowed(&format!("{}/private", server.uri()), "TestBot")
                .await
        );
        assert!(
            cache
                .allowed(&format!("{}/public", server.uri()), "TestBot")
                .await
        );
    }
}
