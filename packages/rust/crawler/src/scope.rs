//! Domain and path-prefix scope checking for one Knowledge Base.
//!
//! A `ScopeFilter` decides whether a candidate URL belongs to a KB and
//! produces its canonical form. Path matching is segment-boundary: the
//! prefix `/admissions-aid` matches `/admissions-aid/apply` but not
//! `/admissions-aidxyz`.

use url::Url;

/// Why a URL was rejected by [`ScopeFilter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidScheme,
    MissingDomain,
    ParseError,
    DomainMismatch,
    PathOutOfScope,
}

impl RejectReason {
    fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidScheme => "invalid_scheme",
            RejectReason::MissingDomain => "missing_domain",
            RejectReason::ParseError => "parse_error",
            RejectReason::DomainMismatch => "domain_mismatch",
            RejectReason::PathOutOfScope => "path_out_of_scope",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a scope check.
#[derive(Debug, Clone)]
pub struct ScopeDecision {
    pub allowed: bool,
    pub matched_prefix: Option<String>,
    pub reason: Option<RejectReason>,
}

impl ScopeDecision {
    fn allow(prefix: String) -> Self {
        Self {
            allowed: true,
            matched_prefix: Some(prefix),
            reason: None,
        }
    }

    fn reject(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            matched_prefix: None,
            reason: Some(reason),
        }
    }
}

/// Scope state for one Knowledge Base: a base domain plus an ordered list of
/// allowed path prefixes, with optional subdomain matching.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    base_domain: String,
    allow_subdomains: bool,
    prefixes: Vec<String>,
    out_of_scope: usize,
}

impl ScopeFilter {
    /// Build a filter from a base domain and a starting set of prefixes.
    /// `base_domain` is lowercased and has one leading `www.` stripped.
    pub fn new(base_domain: &str, allow_subdomains: bool, prefixes: Vec<String>) -> Self {
        let mut normalized: Vec<String> = prefixes.into_iter().map(|p| normalize_path(&p)).collect();
        normalized.dedup();
        // "/" would shadow every other prefix if matched first.
        normalized.sort_by_key(|p| if p == "/" { 1 } else { 0 });

        Self {
            base_domain: normalize_host(base_domain),
            allow_subdomains,
            prefixes: normalized,
            out_of_scope: 0,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn out_of_scope_count(&self) -> usize {
        self.out_of_scope
    }

    /// Read-only scope check against an absolute URL, used to re-validate
    /// redirect targets without touching the out-of-scope counter.
    pub fn is_in_scope(&self, url: &str) -> bool {
        self.check_inner(url, None).allowed
    }

    /// Resolve `url` against `parent` (if relative) and decide whether it is
    /// in scope. Updates the out-of-scope counter on rejection.
    pub fn check(&mut self, url: &str, parent: Option<&str>) -> ScopeDecision {
        let decision = self.check_inner(url, parent);
        if !decision.allowed {
            self.out_of_scope += 1;
        }
        decision
    }

    fn check_inner(&self, url: &str, parent: Option<&str>) -> ScopeDecision {
        let resolved = match resolve(url, parent) {
            Ok(u) => u,
            Err(_) => return ScopeDecision::reject(RejectReason::ParseError),
        };

        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            return ScopeDecision::reject(RejectReason::InvalidScheme);
        }
        let Some(host) = resolved.host_str() else {
            return ScopeDecision::reject(RejectReason::MissingDomain);
        };
        let host = normalize_host(host);

        if !self.domain_matches(&host) {
            return ScopeDecision::reject(RejectReason::DomainMismatch);
        }

        let path = normalize_path(resolved.path());
        for prefix in &self.prefixes {
            if prefix == "/" || path == *prefix || path.starts_with(&format!("{prefix}/")) {
                return ScopeDecision::allow(prefix.clone());
            }
        }
        ScopeDecision::reject(RejectReason::PathOutOfScope)
    }

    fn domain_matches(&self, host: &str) -> bool {
        if host == self.base_domain {
            return true;
        }
        if !self.allow_subdomains {
            return false;
        }
        let root = root_domain(&self.base_domain);
        host == root || host.ends_with(&format!(".{root}"))
    }

    /// Canonical form of an in-scope URL: `scheme://host/path[?query]`, no
    /// fragment, trailing `/` on the final path segment stripped.
    pub fn normalize(&self, url: &str, parent: Option<&str>) -> Option<String> {
        if !self.check_inner(url, parent).allowed {
            return None;
        }
        let resolved = resolve(url, parent).ok()?;
        Some(canonicalize(&resolved))
    }

    /// Extract first-path-segment prefixes from `urls` whose domain matches
    /// this filter, appending any not already present. Returns the newly
    /// added prefixes.
    pub fn discover_prefixes(&mut self, urls: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for url in urls {
            let Ok(parsed) = Url::parse(url) else { continue };
            let Some(host) = parsed.host_str() else { continue };
            if !self.domain_matches(&normalize_host(host)) {
                continue;
            }
            let path = parsed.path();
            let first_segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
            if first_segment.is_empty() {
                continue;
            }
            let candidate = format!("/{}", first_segment.to_ascii_lowercase());
            if !self.prefixes.contains(&candidate) && !added.contains(&candidate) {
                added.push(candidate);
            }
        }
        if !added.is_empty() {
            // "/" must stay last even after appending new prefixes.
            let root_pos = self.prefixes.iter().position(|p| p == "/");
            match root_pos {
                Some(pos) => {
                    for p in &added {
                        self.prefixes.insert(pos, p.clone());
                    }
                }
                None => self.prefixes.extend(added.clone()),
            }
        }
        added
    }
}

fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

fn root_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        domain.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

fn normalize_path(path: &str) -> String {
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

fn resolve(url: &str, parent: Option<&str>) -> Result<Url, url::ParseError> {
    if let Some(rest) = url.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}"));
    }
    match Url::parse(url) {
        Ok(u) => Ok(u),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = parent.ok_or(url::ParseError::RelativeUrlWithoutBase)?;
            let base_url = Url::parse(base)?;
            base_url.join(url)
        }
        Err(e) => Err(e),
    }
}

fn canonicalize(url: &Url) -> String {
    let mut path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    let mut out = format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or(""), path);
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> ScopeFilter {
        ScopeFilter::new("ex.test", false, vec!["/admissions-aid".to_string()])
    }

    #[test]
    fn segment_boundary_match() {
        let mut f = filter();
        assert!(f.check("https://ex.test/admissions-aid/apply", None).allowed);
        assert!(!f.check("https://ex.test/admissions-aidxyz", None).allowed);
    }

    #[test]
    fn root_prefix_matches_everything_on_domain() {
        let mut f = ScopeFilter::new("ex.test", false, vec!["/".to_string()]);
        assert!(f.check("https://ex.test/anything/deep", None).allowed);
    }

    #[test]
    fn domain_mismatch_rejected() {
        let mut f = filter();
        let decision = f.check("https://other.test/admissions-aid", None);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::DomainMismatch));
    }

    #[test]
    fn www_prefix_stripped_both_sides() {
        let mut f = ScopeFilter::new("www.ex.test", false, vec!["/".to_string()]);
        assert!(f.check("https://ex.test/", None).allowed);
    }

    #[test]
    fn subdomain_allowed_only_when_enabled() {
        let mut strict = ScopeFilter::new("ex.test", false, vec!["/".to_string()]);
        assert!(!strict.check("https://docs.ex.test/", None).allowed);

        let mut lenient = ScopeFilter::new("ex.test", true, vec!["/".to_string()]);
        assert!(lenient.check("https://docs.ex.test/", None).allowed);
    }

    #[test]
    fn relative_url_resolves_against_parent() {
        let mut f = filter();
        let decision = f.check("/admissions-aid/apply", Some("https://ex.test/admissions-aid/"));
        assert!(decision.allowed);
    }

    #[test]
    fn protocol_relative_resolves_to_https() {
        let mut f = filter();
        let decision = f.check("//ex.test/admissions-aid", None);
        assert!(decision.allowed);
    }

    #[test]
    fn normalize_strips_fragment_and_trailing_slash() {
        let f = filter();
        let normalized = f.normalize("https://ex.test/admissions-aid/apply/#section", None);
        assert_eq!(normalized.as_deref(), Some("https://ex.test/admissions-aid/apply"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let f = filter();
        let once = f.normalize("https://ex.test/admissions-aid/apply/", None).unwrap();
        let twice = f.normalize(&once, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn discover_prefixes_extracts_first_segment() {
        let mut f = ScopeFilter::new("ex.test", false, vec!["/a".to_string()]);
        let added = f.discover_prefixes(&["https://ex.test/b/1".to_string()]);
        assert_eq!(added, vec!["/b".to_string()]);
        assert!(f.prefixes().iter().any(|p| p == "/b"));
    }

    #[test]
    fn root_prefix_stays_last_after_discovery() {
        let mut f = ScopeFilter::new("ex.test", false, vec!["/".to_string()]);
        f.discover_prefixes(&["https://ex.test/new/page".to_string()]);
        assert_eq!(f.prefixes().last(), Some(&"/".to_string()));
    }

    #[test]
    fn out_of_scope_counter_increments_on_rejection() {
        let mut f = filter();
        f.check("https://other.test/x", None);
        assert_eq!(f.out_of_scope_count(), 1);
    }
}
