//! Tree configuration.
//!
//! Configuration can be built directly or loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `GBTREE_WRITER_LOCK_TIMEOUT_MS`: How long `writer()` waits for the writer
//!   lease (default: `10000`)
//! - `GBTREE_PAGE_CACHE_PAGES`: Page cache capacity in pages (default: `1024`)
//! - `GBTREE_MAX_NODE_KEYS`: Maximum keys per node (default: unbounded, nodes
//!   are limited by page space)
//! - `GBTREE_MAX_SEEK_RETRIES`: Consecutive restarts a seeker attempts before
//!   giving up (default: `1000`)

use std::time::Duration;

use crate::storage::DEFAULT_CACHE_CAPACITY;

/// Tree configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()`:
/// - `page_cache_pages` > 0
/// - `max_node_keys`, if set, is at least 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// How long `writer()`, `checkpoint()` and `close()` wait for the writer
    /// lease.
    pub writer_lock_timeout: Duration,
    /// Page cache capacity in pages.
    pub page_cache_pages: usize,
    /// Maximum keys per node; `None` limits nodes by page space only.
    pub max_node_keys: Option<usize>,
    /// Consecutive restarts a seeker attempts before surfacing corruption.
    pub max_seek_retries: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            writer_lock_timeout: Duration::from_millis(Self::DEFAULT_WRITER_LOCK_TIMEOUT_MS),
            page_cache_pages: DEFAULT_CACHE_CAPACITY,
            max_node_keys: None,
            max_seek_retries: Self::DEFAULT_MAX_SEEK_RETRIES,
        }
    }
}

impl TreeConfig {
    /// Default writer lease timeout in milliseconds.
    pub const DEFAULT_WRITER_LOCK_TIMEOUT_MS: u64 = 10_000;
    /// Default seeker restart bound.
    pub const DEFAULT_MAX_SEEK_RETRIES: usize = 1000;

    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but not a valid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let writer_lock_timeout = parse_var(
            &lookup,
            "GBTREE_WRITER_LOCK_TIMEOUT_MS",
            "a number of milliseconds",
        )?
        .map_or(defaults.writer_lock_timeout, Duration::from_millis);

        let page_cache_pages =
            parse_var::<usize>(&lookup, "GBTREE_PAGE_CACHE_PAGES", "a page count")?;
        let page_cache_pages = match page_cache_pages {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    name: "GBTREE_PAGE_CACHE_PAGES".to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            Some(pages) => pages,
            None => defaults.page_cache_pages,
        };

        let max_node_keys = parse_var::<usize>(&lookup, "GBTREE_MAX_NODE_KEYS", "a key count")?;
        let max_node_keys = match max_node_keys {
            Some(keys) if keys < 2 => {
                return Err(ConfigError::InvalidValue {
                    name: "GBTREE_MAX_NODE_KEYS".to_string(),
                    message: format!("'{keys}' is too small (must be at least 2)"),
                });
            }
            other => other,
        };

        let max_seek_retries = parse_var(&lookup, "GBTREE_MAX_SEEK_RETRIES", "a retry count")?
            .unwrap_or(defaults.max_seek_retries);

        Ok(Self {
            writer_lock_timeout,
            page_cache_pages,
            max_node_keys,
            max_seek_retries,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    expected: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not {expected}"),
            }),
        None => Ok(None),
    }
}
