//! Configuration.
//!
//! The configuration is a JSON file. Every field is optional; missing
//! fields take the defaults below.
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use crate::delegations::Registry;
use crate::fetch::RetryPolicy;
use crate::fetch::SourceLocation;


//------------ SourceConfig --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SourceConfig {
    pub registry: Registry,
    pub url: String,
}

impl SourceConfig {
    fn new(registry: Registry, url: &str) -> Self {
        SourceConfig { registry, url: url.to_string() }
    }

    pub fn location(&self) -> Result<SourceLocation, ConfigError> {
        SourceLocation::from_str(&self.url)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", self.registry, e)))
    }
}


//------------ RetryConfig ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms)
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { max_attempts: 4, initial_delay_ms: 2_000, max_delay_ms: 60_000 }
    }
}


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub sources: Vec<SourceConfig>,

    /// Where the consolidated table is published.
    pub output: PathBuf,

    pub refresh_interval_secs: u64,
    pub retry: RetryConfig,
    pub request_timeout_secs: u64,

    /// Upper bound for a whole refresh cycle. Registries still being
    /// fetched when it runs out count as failed.
    pub cycle_timeout_secs: u64,

    /// How many registries are fetched and parsed at the same time.
    pub workers: usize,

    /// Above this size of the lookup table a warning is logged.
    pub lookup_memory_budget_mib: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sources: vec![
                SourceConfig::new(
                    Registry::Afrinic,
                    "https://ftp.afrinic.net/stats/afrinic/delegated-afrinic-extended-latest"
                ),
                SourceConfig::new(
                    Registry::Apnic,
                    "https://ftp.apnic.net/stats/apnic/delegated-apnic-extended-latest"
                ),
                SourceConfig::new(
                    Registry::Arin,
                    "https://ftp.arin.net/pub/stats/arin/delegated-arin-extended-latest"
                ),
                SourceConfig::new(
                    Registry::Lacnic,
                    "https://ftp.lacnic.net/pub/stats/lacnic/delegated-lacnic-extended-latest"
                ),
                SourceConfig::new(
                    Registry::RipeNcc,
                    "https://ftp.ripe.net/pub/stats/ripencc/delegated-ripencc-extended-latest"
                ),
            ],
            output: PathBuf::from("rirstats.csv"),
            refresh_interval_secs: 7 * 24 * 3600,
            retry: RetryConfig::default(),
            request_timeout_secs: 120,
            cycle_timeout_secs: 1800,
            workers: 5,
            lookup_memory_budget_mib: 512,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_json::from_reader(io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no sources configured".to_string()))
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.registry) {
                return Err(ConfigError::Invalid(
                    format!("{} configured more than once", source.registry)
                ))
            }
            if source.registry == Registry::Iana {
                return Err(ConfigError::Invalid(
                    "iana does not publish delegated stats".to_string()
                ))
            }
            source.location()?;
        }

        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()))
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string()
            ))
        }
        if self.refresh_interval_secs == 0 || self.cycle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("intervals must not be zero".to_string()))
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn lookup_memory_budget(&self) -> usize {
        self.lookup_memory_budget_mib.saturating_mul(1024 * 1024)
    }
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug, Display)]
pub enum ConfigError {
    #[display(fmt = "Cannot read config: {}", _0)]
    Io(io::Error),

    #[display(fmt = "Cannot parse config: {}", _0)]
    Json(serde_json::Error),

    #[display(fmt = "Invalid config: {}", _0)]
    Invalid(String),
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self { ConfigError::Io(e) }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self { ConfigError::Json(e) }
}

impl std::error::Error for ConfigError {}


//------------ Tests --------------------------------------------------------
