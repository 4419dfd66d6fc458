use crate::core::{CommandKind, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default poll interval of the shared scheduler.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3_000);

/// Scheduler intervals below this are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Engine configuration
///
/// Durations are (de)serialized as milliseconds so the config can live in a
/// JSON file next to the rest of the dashboard settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval of the shared poll timer
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,

    /// Upper bound on a single dispatch call
    #[serde(rename = "dispatch_timeout_ms", with = "millis")]
    pub dispatch_timeout: Duration,

    /// Upper bound on a single fetch call; expiry counts as a transient error
    #[serde(rename = "fetch_timeout_ms", with = "millis")]
    pub fetch_timeout: Duration,

    /// Deadline for a command to resolve, measured from dispatch
    #[serde(rename = "resolution_timeout_ms", with = "optional_millis")]
    pub resolution_timeout: Option<Duration>,

    /// Per-kind overrides of `resolution_timeout`
    #[serde(rename = "kind_resolution_timeouts_ms", with = "kind_millis")]
    pub kind_resolution_timeouts: HashMap<CommandKind, Duration>,

    /// How long resolved commands stay in the store before each tick purges them
    #[serde(rename = "resolved_retention_ms", with = "optional_millis")]
    pub resolved_retention: Option<Duration>,

    /// Recompute the registry entry when a pending command is evicted
    pub recompute_on_evict: bool,

    /// Capacity of the broadcast event channel
    pub event_capacity: usize,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            dispatch_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            resolution_timeout: None,
            kind_resolution_timeouts: HashMap::new(),
            resolved_retention: None,
            recompute_on_evict: false,
            event_capacity: 256,
        }
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the dispatch timeout
    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the fetch timeout
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the resolution deadline for every kind
    pub fn resolution_timeout(mut self, timeout: Duration) -> Self {
        self.resolution_timeout = Some(timeout);
        self
    }

    /// Set the resolution deadline for one kind
    pub fn kind_resolution_timeout(mut self, kind: CommandKind, timeout: Duration) -> Self {
        self.kind_resolution_timeouts.insert(kind, timeout);
        self
    }

    /// Set how long resolved commands are retained
    pub fn resolved_retention(mut self, retention: Duration) -> Self {
        self.resolved_retention = Some(retention);
        self
    }

    /// Recompute registry entries on eviction
    pub fn recompute_on_evict(mut self, enabled: bool) -> Self {
        self.recompute_on_evict = enabled;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Resolution deadline that applies to `kind`, if any.
    pub fn resolution_timeout_for(&self, kind: CommandKind) -> Option<Duration> {
        self.kind_resolution_timeouts
            .get(&kind)
            .copied()
            .or(self.resolution_timeout)
    }

    /// Poll interval with the scheduler floor applied.
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "dispatch_timeout must be greater than zero".to_string(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "fetch_timeout must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.resolution_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(EngineError::InvalidConfig(
                "resolution_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(kind) = self
            .kind_resolution_timeouts
            .iter()
            .find_map(|(kind, timeout)| timeout.is_zero().then_some(kind))
        {
            return Err(EngineError::InvalidConfig(format!(
                "resolution timeout for {} must be greater than zero",
                kind
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON config document
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cmdtrack::EngineConfig;
    /// let config = EngineConfig::from_json(r#"{"poll_interval_ms": 1000}"#).unwrap();
    /// assert_eq!(config.poll_interval.as_millis(), 1000);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| EngineError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

mod kind_millis {
    use crate::core::CommandKind;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &HashMap<CommandKind, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .iter()
            .map(|(kind, timeout)| (*kind, timeout.as_millis() as u64))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<CommandKind, Duration>, D::Error> {
        Ok(HashMap::<CommandKind, u64>::deserialize(deserializer)?
            .into_iter()
            .map(|(kind, ms)| (kind, Duration::from_millis(ms)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_interval() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(3_000));
        assert!(config.resolution_timeout.is_none());
        assert!(!config.recompute_on_evict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn kind_override_wins_over_global_timeout() {
        let config = EngineConfig::new()
            .resolution_timeout(Duration::from_secs(60))
            .kind_resolution_timeout(CommandKind::CancelDeployment, Duration::from_secs(5));

        assert_eq!(
            config.resolution_timeout_for(CommandKind::CancelDeployment),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            config.resolution_timeout_for(CommandKind::SyncApplication),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn from_json_reads_millis_and_kind_overrides() {
        let config = EngineConfig::from_json(
            r#"{
                "poll_interval_ms": 500,
                "resolution_timeout_ms": 120000,
                "kind_resolution_timeouts_ms": {"SkipStage": 1000},
                "recompute_on_evict": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.resolution_timeout, Some(Duration::from_secs(120)));
        assert_eq!(
            config.resolution_timeout_for(CommandKind::SkipStage),
            Some(Duration::from_secs(1))
        );
        assert!(config.recompute_on_evict);
        assert_eq!(config.dispatch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = EngineConfig::from_json(r#"{"poll_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn zero_resolution_timeouts_are_rejected() {
        let global = EngineConfig::new().resolution_timeout(Duration::ZERO);
        assert!(matches!(global.validate(), Err(EngineError::InvalidConfig(_))));

        let per_kind =
            EngineConfig::new().kind_resolution_timeout(CommandKind::SkipStage, Duration::ZERO);
        assert!(matches!(per_kind.validate(), Err(EngineError::InvalidConfig(_))));

        let err = EngineConfig::from_json(r#"{"resolution_timeout_ms": 0}"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn tiny_interval_is_floored() {
        let config = EngineConfig::new().poll_interval(Duration::from_millis(1));
        assert_eq!(config.effective_poll_interval(), MIN_POLL_INTERVAL);
    }
}
