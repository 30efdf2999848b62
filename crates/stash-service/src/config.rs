use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::kv::KvConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the cache layer.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    ///
    /// If this is set, the environment will be read from the `STASH_ENVIRONMENT`
    /// environment variable.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stash".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the cache-aside engines.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Time-to-live of every entry written by the data-access helpers.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for the logging system.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// The remote key-value store backing all caches.
    pub cache_store: KvConfig,

    /// Expiration settings of the caches.
    pub caches: CacheConfigs,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Config = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        // entries without expiration would never be evicted
        if self.caches.default_ttl.is_zero() {
            anyhow::bail!("caches.default_ttl must be positive");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::kv::RedisConfig;

    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.default_ttl, Duration::from_secs(10));
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "stash");

        let KvConfig::Redis(redis) = cfg.cache_store else {
            panic!("redis should be the default backend");
        };
        assert_eq!(redis, RedisConfig::default());
        assert_eq!(redis.addr, "127.0.0.1:6379");
        assert_eq!(redis.pool_size, 20);
        assert_eq!(redis.min_idle_conns, 10);
    }

    #[test]
    fn test_partial_redis_config() {
        // Individual settings can be overridden without affecting the other defaults.
        let yaml = r#"
            cache_store:
              backend: redis
              addr: "cache.internal:6380"
              db: 3
              operation_timeout: 250ms
            caches:
              default_ttl: 1m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.default_ttl, Duration::from_secs(60));

        let KvConfig::Redis(redis) = cfg.cache_store else {
            panic!("expected a redis backend");
        };
        assert_eq!(redis.addr, "cache.internal:6380");
        assert_eq!(redis.db, 3);
        assert_eq!(redis.operation_timeout, Duration::from_millis(250));
        assert_eq!(redis.pool_size, RedisConfig::default().pool_size);
        assert_eq!(redis.connect_timeout, RedisConfig::default().connect_timeout);
    }

    #[test]
    fn test_memory_backend() {
        let yaml = r#"
            cache_store:
              backend: memory
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert!(matches!(cfg.cache_store, KvConfig::Memory));
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let yaml = r#"
            caches:
              default_ttl: 0s
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "caches.default_ttl must be positive");

        let yaml = r#"
            caches:
              default_ttl: 250ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.default_ttl, Duration::from_millis(250));
    }

    #[test]
    fn test_empty_file() {
        let dir = stash_test::tempdir();
        let path = dir.path().join("config.yml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"   \n").unwrap();

        let err = Config::get(Some(&path)).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }

    #[test]
    fn test_missing_file() {
        let dir = stash_test::tempdir();
        let err = Config::get(Some(&dir.path().join("nope.yml"))).unwrap_err();
        assert_eq!(err.to_string(), "failed to open configuration file");
    }
}
