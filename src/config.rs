//! Runtime Configuration
//!
//! Configuration is read once from environment variables and frozen for the
//! lifetime of the process. Invalid values never abort: they produce a
//! warning on stderr and the affected setting falls back to its default,
//! so a misconfigured launcher degrades to "use everything" rather than
//! failing.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `NUMA_NODES` | Comma-separated physical node IDs, ranges allowed (`0,2-4`) | all nodes |
//! | `NUMA_THREADS` | Positive integer capping worker threads per node | 0 (= all hw threads) |
//! | `NUMA_DEBUG` | One of `INFO`, `DEBUG`, `CRITICAL`, `NONE` | `CRITICAL` |

use std::env;
use std::sync::OnceLock;

use crate::log::LogLevel;

/// Frozen snapshot of all environment-derived configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Physical node IDs requested via `NUMA_NODES`, sorted ascending.
    /// `None` means "use every node the topology reports".
    pub node_set: Option<Vec<i32>>,
    /// Per-node worker thread cap from `NUMA_THREADS`; 0 means "all".
    pub thread_cap: usize,
    /// Log level from `NUMA_DEBUG`.
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_set: None,
            thread_cap: 0,
            log_level: LogLevel::Critical,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("NUMA_NODES") {
            match parse_node_set(&val) {
                Some(ids) => config.node_set = Some(ids),
                None => {
                    eprintln!(
                        "nodal: invalid NUMA_NODES value \"{}\". Using all nodes.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = env::var("NUMA_THREADS") {
            match parse_thread_cap(&val) {
                Some(cap) => config.thread_cap = cap,
                None => {
                    eprintln!(
                        "nodal: invalid NUMA_THREADS value \"{}\". Using all available threads.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = env::var("NUMA_DEBUG") {
            match LogLevel::parse(&val) {
                Some(level) => config.log_level = level,
                None => {
                    eprintln!(
                        "nodal: invalid NUMA_DEBUG value \"{}\". Supported: INFO, DEBUG, CRITICAL, NONE.",
                        val
                    );
                }
            }
        }

        config
    }
}

/// Get the process-wide configuration, loading it on first access.
pub fn get() -> &'static RuntimeConfig {
    static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

/// Parse a node-set string of the form `a,b,c-d` into a sorted ID list.
///
/// Returns `None` on any malformed part, an empty input, or a reversed
/// range. Duplicates are kept (the mapping layer warns about them).
pub fn parse_node_set(s: &str) -> Option<Vec<i32>> {
    let mut ids = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        let (a, b) = match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: i32 = lo.trim().parse().ok()?;
                let hi: i32 = hi.trim().parse().ok()?;
                (lo, hi)
            }
            None => {
                let v: i32 = part.parse().ok()?;
                (v, v)
            }
        };
        if a < 0 || b < a {
            return None;
        }
        for i in a..=b {
            ids.push(i);
        }
    }
    if ids.is_empty() {
        return None;
    }
    ids.sort_unstable();
    Some(ids)
}

/// Parse the thread-cap string: a non-negative integer (0 = "all").
pub fn parse_thread_cap(s: &str) -> Option<usize> {
    s.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_set_single() {
        assert_eq!(parse_node_set("3"), Some(vec![3]));
    }

    #[test]
    fn test_parse_node_set_list_and_range() {
        assert_eq!(parse_node_set("0,2-4"), Some(vec![0, 2, 3, 4]));
        assert_eq!(parse_node_set("4,1"), Some(vec![1, 4]));
    }

    #[test]
    fn test_parse_node_set_rejects_garbage() {
        assert_eq!(parse_node_set(""), None);
        assert_eq!(parse_node_set("a,b"), None);
        assert_eq!(parse_node_set("3-1"), None);
        assert_eq!(parse_node_set("-1"), None);
        assert_eq!(parse_node_set("0,,2"), None);
    }

    #[test]
    fn test_parse_node_set_keeps_duplicates() {
        assert_eq!(parse_node_set("1,1-2"), Some(vec![1, 1, 2]));
    }

    #[test]
    fn test_parse_thread_cap() {
        assert_eq!(parse_thread_cap("8"), Some(8));
        assert_eq!(parse_thread_cap("0"), Some(0));
        assert_eq!(parse_thread_cap("lots"), None);
        assert_eq!(parse_thread_cap("-2"), None);
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.node_set.is_none());
        assert_eq!(config.thread_cap, 0);
        assert_eq!(config.log_level, LogLevel::Critical);
    }
}
