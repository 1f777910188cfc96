//! Runtime knobs read from `TETHER_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    /// Component this instance serves; relation updates for other components are ignored.
    pub domain: String,
    pub package: String,
    pub org_id: String,
    pub retry_initial_ms: u64,
    pub retry_multiplier: f64,
    pub retry_exponential: bool,
    pub retry_max_attempts: u32,
    pub buffer_retention_secs: u64,
    pub buffer_cleanup_secs: u64,
    pub queue_cap: usize,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            package: String::new(),
            org_id: String::new(),
            retry_initial_ms: 1_000,
            retry_multiplier: 2.0,
            retry_exponential: true,
            retry_max_attempts: 5,
            buffer_retention_secs: 7 * 24 * 60 * 60,
            buffer_cleanup_secs: 60 * 60,
            queue_cap: 2048,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

impl TetherConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            domain: std::env::var("TETHER_DOMAIN").unwrap_or(d.domain).to_ascii_lowercase(),
            package: std::env::var("TETHER_PACKAGE").unwrap_or(d.package).to_ascii_lowercase(),
            org_id: std::env::var("TETHER_ORG_ID").unwrap_or(d.org_id),
            retry_initial_ms: env_or("TETHER_RETRY_INITIAL_MS", d.retry_initial_ms),
            retry_multiplier: env_or("TETHER_RETRY_MULTIPLIER", d.retry_multiplier),
            retry_exponential: env_or("TETHER_RETRY_EXPONENTIAL", d.retry_exponential),
            retry_max_attempts: env_or("TETHER_RETRY_MAX_ATTEMPTS", d.retry_max_attempts),
            buffer_retention_secs: env_or("TETHER_BUFFER_RETENTION_SECS", d.buffer_retention_secs),
            buffer_cleanup_secs: env_or("TETHER_BUFFER_CLEANUP_SECS", d.buffer_cleanup_secs),
            queue_cap: env_or("TETHER_QUEUE_CAP", d.queue_cap),
        }
    }

    pub fn for_component(domain: &str, package: &str, org_id: &str) -> Self {
        Self { domain: domain.to_ascii_lowercase(), package: package.to_ascii_lowercase(), org_id: org_id.to_string(), ..Self::default() }
    }

    pub fn buffer_retention(&self) -> Duration { Duration::from_secs(self.buffer_retention_secs) }
    pub fn buffer_cleanup_interval(&self) -> Duration { Duration::from_secs(self.buffer_cleanup_secs.max(1)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = TetherConfig::default();
        assert_eq!(c.retry_max_attempts, 5);
        assert_eq!(c.buffer_retention(), Duration::from_secs(604_800));
        assert!(c.retry_exponential);
    }

    #[test]
    fn component_is_lower_cased() {
        let c = TetherConfig::for_component("School", "Roster", "example.org");
        assert_eq!(c.domain, "school");
        assert_eq!(c.package, "roster");
        assert_eq!(c.org_id, "example.org");
    }
}
