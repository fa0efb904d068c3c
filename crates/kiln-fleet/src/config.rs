//! Fleet configuration.

use chrono::Duration;
use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fleet monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Seconds between monitor passes.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Minutes after which a checked host is due for another reachability
    /// probe.
    #[serde(default = "default_reachability_interval")]
    pub reachability_interval_mins: i64,
    /// Lead times before expiration at which a spawned host's owner is
    /// notified, as `<n>h` or `<n>m`.
    #[serde(default = "default_notification_buckets")]
    pub notification_buckets: Vec<String>,
    /// Terminate user-spawned hosts once they pass their expiration time.
    #[serde(default = "default_true")]
    pub terminate_expired: bool,
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_reachability_interval() -> i64 {
    10
}

fn default_notification_buckets() -> Vec<String> {
    vec!["2h".to_string(), "12h".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval(),
            reachability_interval_mins: default_reachability_interval(),
            notification_buckets: default_notification_buckets(),
            terminate_expired: default_true(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FleetConfig =
            serde_yaml::from_str(&contents).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, overridden by `KILN_*` environment
    /// variables (`KILN_MONITOR_INTERVAL_SECS=30`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: FleetConfig = builder
            .add_source(
                config::Environment::with_prefix("KILN")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("notification_buckets"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "monitor_interval_secs must be positive".to_string(),
            ));
        }
        self.reachability_interval()?;
        self.buckets().map(|_| ())
    }

    /// Notification buckets as (tag, lead time), longest lead time first.
    pub fn buckets(&self) -> Result<Vec<(String, Duration)>> {
        let mut out = self
            .notification_buckets
            .iter()
            .map(|tag| parse_lead_time(tag).map(|d| (tag.clone(), d)))
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(out)
    }

    pub fn reachability_interval(&self) -> Result<Duration> {
        let invalid = || {
            Error::InvalidConfig(format!(
                "invalid reachability_interval_mins {}",
                self.reachability_interval_mins
            ))
        };
        if self.reachability_interval_mins <= 0 {
            return Err(invalid());
        }
        Duration::try_minutes(self.reachability_interval_mins).ok_or_else(invalid)
    }
}

fn parse_lead_time(tag: &str) -> Result<Duration> {
    let invalid = || Error::InvalidConfig(format!("invalid notification bucket '{tag}'"));
    let unit = tag.chars().last().ok_or_else(invalid)?;
    let n: i64 = tag[..tag.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if n <= 0 {
        return Err(invalid());
    }
    match unit {
        'h' => Duration::try_hours(n),
        'm' => Duration::try_minutes(n),
        _ => None,
    }
    .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config: FleetConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.monitor_interval_secs, 60);
        assert_eq!(config.notification_buckets, vec!["2h", "12h"]);
        assert!(config.terminate_expired);
    }

    #[test]
    fn test_buckets_sorted_longest_first() {
        let config = FleetConfig {
            notification_buckets: vec!["30m".to_string(), "12h".to_string(), "2h".to_string()],
            ..Default::default()
        };
        let tags: Vec<String> = config.buckets().unwrap().into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, vec!["12h", "2h", "30m"]);
    }

    #[test]
    fn test_bad_bucket_is_rejected() {
        for bad in ["", "h", "2d", "-1h", "0m", "999999999999999h", "9223372036854775807m"] {
            let config = FleetConfig {
                notification_buckets: vec![bad.to_string()],
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_reachability_interval_must_be_positive_and_in_range() {
        for bad in [0, -5, i64::MAX] {
            let config = FleetConfig {
                reachability_interval_mins: bad,
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig(_))),
                "{bad} should be rejected"
            );
        }
        assert_eq!(
            FleetConfig::default().reachability_interval().unwrap(),
            Duration::minutes(10)
        );
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("kiln-fleet-{}.yml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "monitor_interval_secs: 5\nterminate_expired: false\n").unwrap();
        let config = FleetConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.monitor_interval_secs, 5);
        assert!(!config.terminate_expired);
        assert_eq!(config.reachability_interval_mins, 10);
    }
}
