//! Job configuration loading and validation.
//!
//! A `JobConfig` is normally constructed in-process (e.g. by a REST layer
//! deserializing a request body), but the CLI loads one from a TOML file on
//! disk.

use std::path::{Path, PathBuf};

use crate::error::{CrawlError, Result};
use crate::types::JobConfig;

const CONFIG_DIR_NAME: &str = ".webcrawl";
const DEFAULT_JOB_FILE_NAME: &str = "job.toml";

/// The path to the default job config directory (`~/.webcrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// The path to the default job config file (`~/.webcrawl/job.toml`), used
/// when the CLI is invoked without an explicit `--config` path.
pub fn default_job_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(DEFAULT_JOB_FILE_NAME))
}

/// Load a `JobConfig` from a TOML file at `path`.
pub fn load_job_config(path: &Path) -> Result<JobConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CrawlError::io(path, e))?;
    toml::from_str(&content)
        .map_err(|e| CrawlError::config(format!("failed to parse {}: {e}", path.display())))
}

/// The hard validation errors from spec.md §4.7, run at job creation time.
///
/// Returns `Ok(())` if the config is valid, otherwise `Err` with every
/// violation joined into one message (a caller wanting the individual
/// messages should use [`validate_errors`] instead).
pub fn validate(config: &JobConfig) -> Result<()> {
    let errors = validate_errors(config);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CrawlError::config(errors.join("; ")))
    }
}

/// The hard validation errors from spec.md §4.7, as a list of messages.
pub fn validate_errors(config: &JobConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let active: Vec<&crate::types::KBConfig> = config.active_kbs().collect();
    if active.is_empty() {
        errors.push("at least one active KB is required".to_string());
    }

    let mut seen_ids = std::collections::HashSet::new();
    let mut seen_names = std::collections::HashSet::new();
    for kb in &config.kbs {
        if !seen_ids.insert(kb.kb_id.clone()) {
            errors.push(format!("duplicate KB id: {}", kb.kb_id));
        }
        if !seen_names.insert(kb.name.to_ascii_lowercase()) {
            errors.push(format!("duplicate KB name (case-insensitive): {}", kb.name));
        }
        if kb.entry_urls.is_empty() {
            errors.push(format!("KB '{}' has no entry URLs", kb.name));
        }
    }

    errors
}

/// Pairwise scope-overlap warnings across active KBs (advisory, not a hard
/// error): prefixes are "identical" if equal, "nested" if one is a path
/// segment prefix of the other.
pub fn detect_overlaps(config: &JobConfig) -> Vec<String> {
    let active: Vec<&crate::types::KBConfig> = config.active_kbs().collect();
    let mut warnings = Vec::new();

    for (i, kb1) in active.iter().enumerate() {
        let p1 = kb1.derived_prefixes();
        for kb2 in &active[i + 1..] {
            let p2 = kb2.derived_prefixes();
            for a in &p1 {
                for b in &p2 {
                    if a == b {
                        warnings.push(format!(
                            "KB '{}' and '{}' share identical prefix {}",
                            kb1.name, kb2.name, a
                        ));
                    } else if a.starts_with(&format!("{b}/")) {
                        warnings.push(format!(
                            "KB '{}' prefix {} is nested under '{}' prefix {}",
                            kb1.name, a, kb2.name, b
                        ));
                    } else if b.starts_with(&format!("{a}/")) {
                        warnings.push(format!(
                            "KB '{}' prefix {} is nested under '{}' prefix {}",
                            kb2.name, b, kb1.name, a
                        ));
                    }
                }
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrawlMode, KBConfig};

    fn kb(id: &str, name: &str, url: &str) -> KBConfig {
        KBConfig {
            kb_id: id.into(),
            name: name.into(),
            entry_urls: vec![url.into()],
            is_active: true,
            max_depth: None,
        }
    }

    fn base_job(kbs: Vec<KBConfig>) -> JobConfig {
        JobConfig {
            base_domain: "ex.test".into(),
            kbs,
            mode: CrawlMode::CrawlAndScrape,
            max_depth: 3,
            worker_count: 4,
            parallel_kbs: 2,
            allow_subdomains: false,
            include_child_pages: true,
            respect_robots: true,
            auto_discover_prefixes: false,
        }
    }

    #[test]
    fn rejects_no_active_kb() {
        let mut job = base_job(vec![kb("a", "A", "https://ex.test/a")]);
        job.kbs[0].is_active = false;
        let errors = validate_errors(&job);
        assert!(errors.iter().any(|e| e.contains("at least one active KB")));
    }

    #[test]
    fn rejects_duplicate_ids_and_names() {
        let job = base_job(vec![
            kb("dup", "Same", "https://ex.test/a"),
            kb("dup", "same", "https://ex.test/b"),
        ]);
        let errors = validate_errors(&job);
        assert!(errors.iter().any(|e| e.contains("duplicate KB id")));
        assert!(errors.iter().any(|e| e.contains("duplicate KB name")));
    }

    #[test]
    fn accepts_well_formed_job() {
        let job = base_job(vec![kb("a", "A", "https://ex.test/a")]);
        assert!(validate(&job).is_ok());
    }

    #[test]
    fn detects_nested_prefix_overlap() {
        let job = base_job(vec![
            kb("a", "A", "https://ex.test/admissions-aid"),
            kb("b", "B", "https://ex.test/admissions-aid/apply"),
        ]);
        let warnings = detect_overlaps(&job);
        assert!(warnings.iter().any(|w| w.contains("nested")));
    }

    #[test]
    fn no_overlap_for_disjoint_prefixes() {
        let job = base_job(vec![
            kb("a", "A", "https://ex.test/a"),
            kb("b", "B", "https://ex.test/b"),
        ]);
        assert!(detect_overlaps(&job).is_empty());
    }
}
