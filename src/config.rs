//! # State Configuration
//!
//! Defaults plus environment overrides for the state cache and its server.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `GLB_STATE_DUMP_DIR` | `./var/state` | directory of `items.gz`, `triggers.gz` |
//! | `GLB_STATE_DUMP_INTERVAL_SECS` | 300 | seconds between periodic dumps, 0 disables them |
//! | `GLB_STATE_CACHE_SIZE` | 0 | bytes of the shared segment, 0 for the unbounded heap |
//! | `GLB_STATE_HISTORY_DB` | unset | SQLite history database |
//! | `GLB_STATE_ITEM_TTL_SECS` | 0 | drop items idle this long, 0 keeps them |
//! | `GLB_STATE_TRIGGER_TTL_SECS` | 0 | drop triggers not calculated this long, 0 keeps them |

use log::warn;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_DUMP_DIR: &str = "GLB_STATE_DUMP_DIR";
pub const ENV_DUMP_INTERVAL: &str = "GLB_STATE_DUMP_INTERVAL_SECS";
pub const ENV_CACHE_SIZE: &str = "GLB_STATE_CACHE_SIZE";
pub const ENV_HISTORY_DB: &str = "GLB_STATE_HISTORY_DB";
pub const ENV_ITEM_TTL: &str = "GLB_STATE_ITEM_TTL_SECS";
pub const ENV_TRIGGER_TTL: &str = "GLB_STATE_TRIGGER_TTL_SECS";

/// Configuration of the state cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StateConfig {
    /// Directory holding the table dumps
    pub dump_dir: PathBuf,

    /// Interval between periodic dumps
    pub dump_interval: Duration,

    /// Shared segment size in bytes; 0 runs on the unbounded heap
    pub cache_size: usize,

    /// SQLite history database consulted on cache misses
    pub history_db: Option<PathBuf>,

    /// Idle seconds after which an item is dropped (0 = never)
    pub item_ttl_secs: i64,

    /// Seconds without calculation after which a trigger is dropped (0 = never)
    pub trigger_ttl_secs: i64,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            dump_dir: PathBuf::from("./var/state"),
            dump_interval: Duration::from_secs(300),
            cache_size: 0,
            history_db: None,
            item_ttl_secs: 0,
            trigger_ttl_secs: 0,
        }
    }
}

impl StateConfig {
    /// Defaults overridden by the `GLB_STATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `lookup`. Unparsable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = StateConfig::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        StateConfig {
            dump_dir: non_empty(ENV_DUMP_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.dump_dir),
            dump_interval: Duration::from_secs(parse_or(
                ENV_DUMP_INTERVAL,
                non_empty(ENV_DUMP_INTERVAL),
                defaults.dump_interval.as_secs(),
            )),
            cache_size: parse_or(ENV_CACHE_SIZE, non_empty(ENV_CACHE_SIZE), defaults.cache_size),
            history_db: non_empty(ENV_HISTORY_DB).map(PathBuf::from),
            item_ttl_secs: parse_or(ENV_ITEM_TTL, non_empty(ENV_ITEM_TTL), defaults.item_ttl_secs),
            trigger_ttl_secs: parse_or(
                ENV_TRIGGER_TTL,
                non_empty(ENV_TRIGGER_TTL),
                defaults.trigger_ttl_secs,
            ),
        }
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value '{}' for {}, using default {}", raw, key, default);
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> StateConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StateConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = StateConfig::default();
        assert_eq!(config.dump_dir, PathBuf::from("./var/state"));
        assert_eq!(config.dump_interval.as_secs(), 300);
        assert_eq!(config.cache_size, 0);
        assert!(config.history_db.is_none());
        assert_eq!(from_map(&[]), config);
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            (ENV_DUMP_DIR, "/tmp/state"),
            (ENV_DUMP_INTERVAL, "60"),
            (ENV_CACHE_SIZE, "1048576"),
            (ENV_HISTORY_DB, "/tmp/history.db"),
            (ENV_ITEM_TTL, "86400"),
            (ENV_TRIGGER_TTL, " 3600 "),
        ]);
        assert_eq!(config.dump_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.dump_interval, Duration::from_secs(60));
        assert_eq!(config.cache_size, 1 << 20);
        assert_eq!(config.history_db, Some(PathBuf::from("/tmp/history.db")));
        assert_eq!(config.item_ttl_secs, 86400);
        assert_eq!(config.trigger_ttl_secs, 3600);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_map(&[
            (ENV_DUMP_INTERVAL, "often"),
            (ENV_CACHE_SIZE, "-1"),
            (ENV_DUMP_DIR, "  "),
        ]);
        assert_eq!(config, StateConfig::default());
    }
}
