//! Configuration of the download service.
//!
//! Configuration is read from a TOML file, with every field optional:
//!
//! ```toml
//! concurrency = 3
//! look_ahead = 2
//! repeat = "all"
//! cache_dir = "/var/cache/spool"
//!
//! [retry]
//! attempts = 5
//! min_delay = 500    # milliseconds
//! max_delay = 30000  # milliseconds
//! ```

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::{
    controller::RepeatMode,
    error::{Error, Result},
};

/// Retry policy for failed downloads.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Retry {
    /// Total number of attempts, including the first one.
    pub attempts: u32,

    /// Delay before the first retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_delay: Duration,

    /// Upper bound of the delay between retries.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 5,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum number of simultaneous downloads.
    pub concurrency: NonZeroUsize,

    /// Number of units after the current one to prefetch first.
    pub look_ahead: usize,

    pub retry: Retry,
    pub repeat: RepeatMode,

    /// Where the binary caches downloads. The library takes its storage as
    /// a collaborator and ignores this.
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    /// Default number of simultaneous downloads.
    pub const DEFAULT_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(2) {
        Some(concurrency) => concurrency,
        None => unreachable!(),
    };

    /// Default size of the look-ahead window.
    pub const DEFAULT_LOOK_AHEAD: usize = 2;

    /// Reads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// does not pass [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("read configuration from {}", path.display());
        Ok(config)
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when no attempts are allowed, or when the
    /// retry delays are out of order.
    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            return Err(Error::invalid_argument(
                "retry attempts must be at least 1",
            ));
        }

        if self.retry.min_delay > self.retry.max_delay {
            return Err(Error::invalid_argument(format!(
                "minimum retry delay {:?} exceeds maximum {:?}",
                self.retry.min_delay, self.retry.max_delay
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: Self::DEFAULT_CONCURRENCY,
            look_ahead: Self::DEFAULT_LOOK_AHEAD,
            retry: Retry::default(),
            repeat: RepeatMode::default(),
            cache_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            concurrency = 4
            repeat = "one"

            [retry]
            min_delay = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency.get(), 4);
        assert_eq!(config.look_ahead, Config::DEFAULT_LOOK_AHEAD);
        assert_eq!(config.repeat, RepeatMode::One);
        assert_eq!(config.retry.min_delay, Duration::from_millis(250));
        assert_eq!(config.retry.attempts, Retry::default().attempts);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_nonsense() {
        assert!(toml::from_str::<Config>("concurrency = 0").is_err());
        assert!(toml::from_str::<Config>("prefetch = 3").is_err());

        let mut config = Config::default();
        config.retry.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.min_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
