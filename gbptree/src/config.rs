//! Tree configuration.
//!
//! Configuration is normally built in code with the `with_*` methods, but it
//! can also be loaded from environment variables, which is convenient for
//! tools and benchmarks.
//!
//! # Environment Variables
//!
//! - `GBPTREE_PAGE_SIZE`: page size in bytes (default: `8192`)
//! - `GBPTREE_SPLIT_RATIO`: share of a splitting node kept in the left half (default: `0.5`)
//! - `GBPTREE_READ_AHEAD`: max entries a seek cursor reads per leaf visit (default: `100`)
//! - `GBPTREE_CLEANUP`: `immediate` or `deferred` (default: `immediate`)
//! - `GBPTREE_READ_ONLY`: `true` or `false` (default: `false`)
//!
//! # Invariants
//!
//! A validated config always has a power-of-two page size within
//! [`MIN_PAGE_SIZE`, `MAX_PAGE_SIZE`], a split ratio within `[0, 1]` and a
//! non-zero read-ahead.

use crate::pagecache::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// When the crash-generation cleaner runs after an unclean shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Clean crashed pointers while opening the tree.
    Immediate,
    /// Clean on the next checkpoint, or on an explicit `cleanup()` call.
    Deferred,
}

/// Tree configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    /// Page size in bytes. Must match the page size of an existing file.
    pub page_size: usize,
    /// Ratio of space to keep in the left node when splitting.
    pub split_ratio: f64,
    /// Maximum number of entries a seek cursor reads from one leaf at a time.
    pub read_ahead: usize,
    /// Crash cleanup timing.
    pub cleanup: CleanupMode,
    /// Open without writing anything to the file.
    pub read_only: bool,
}

/// Error returned when a configuration value is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range or cannot be parsed.
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
            page_size: Self::DEFAULT_PAGE_SIZE,
            split_ratio: Self::DEFAULT_SPLIT_RATIO,
            read_ahead: Self::DEFAULT_READ_AHEAD,
            cleanup: CleanupMode::Immediate,
            read_only: false,
        }
    }
}

impl TreeConfig {
    /// Default page size.
    pub const DEFAULT_PAGE_SIZE: usize = 8192;
    /// Default split ratio, an even split.
    pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;
    /// Default seek read-ahead.
    pub const DEFAULT_READ_AHEAD: usize = 100;

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_split_ratio(mut self, split_ratio: f64) -> Self {
        self.split_ratio = split_ratio;
        self
    }

    #[must_use]
    pub const fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    #[must_use]
    pub const fn with_cleanup(mut self, cleanup: CleanupMode) -> Self {
        self.cleanup = cleanup;
        self
    }

    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(ConfigError::InvalidValue {
                name: "page_size".to_string(),
                message: format!(
                    "{} is not a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                    self.page_size
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.split_ratio) {
            return Err(ConfigError::InvalidValue {
                name: "split_ratio".to_string(),
                message: format!("{} is not within [0, 1]", self.split_ratio),
            });
        }
        if self.read_ahead == 0 {
            return Err(ConfigError::InvalidValue {
                name: "read_ahead".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            page_size: parse_var(&lookup, "GBPTREE_PAGE_SIZE")?.unwrap_or(defaults.page_size),
            split_ratio: parse_var(&lookup, "GBPTREE_SPLIT_RATIO")?
                .unwrap_or(defaults.split_ratio),
            read_ahead: parse_var(&lookup, "GBPTREE_READ_AHEAD")?.unwrap_or(defaults.read_ahead),
            cleanup: match lookup("GBPTREE_CLEANUP") {
                None => defaults.cleanup,
                Some(value) => parse_cleanup(&value)?,
            },
            read_only: parse_var(&lookup, "GBPTREE_READ_ONLY")?.unwrap_or(defaults.read_only),
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' cannot be parsed"),
            })
        })
        .transpose()
}

fn parse_cleanup(value: &str) -> Result<CleanupMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "immediate" => Ok(CleanupMode::Immediate),
        "deferred" => Ok(CleanupMode::Deferred),
        _ => Err(ConfigError::InvalidValue {
            name: "GBPTREE_CLEANUP".to_string(),
            message: format!("'{value}' is not one of immediate, deferred"),
        }),
    }
}
