//! Job-level error type for the crawl engine.
//!
//! Page-level failures are never raised as errors — they are recorded as
//! [`crate::types::Failure`] values on a `PageResult` and the crawl keeps
//! going (`spec.md` §7). This type covers the infrastructure failures that
//! legitimately abort a whole job: bad configuration, an HTTP client that
//! could not be built, a config file that could not be read or parsed.

use std::path::PathBuf;

/// Top-level error type for job setup and configuration.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Job configuration failed validation (spec.md §4.7 hard errors).
    #[error("config error: {message}")]
    Config { message: String },

    /// The shared HTTP client could not be constructed.
    #[error("network error: {0}")]
    Network(String),

    /// Filesystem I/O error while loading a config file.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CrawlError>;

impl CrawlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CrawlError::config("no active KB");
        assert_eq!(err.to_string(), "config error: no active KB");
    }
}
