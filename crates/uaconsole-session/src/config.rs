// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client configuration.
//!
//! All settings arrive already parsed (from the command line or a caller);
//! nothing here reads files. Durations serialize as humantime strings such
//! as `"1s"` or `"250ms"`.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use uaconsole_session::config::ClientConfig;
//!
//! let config = ClientConfig::builder()
//!     .endpoint("opc.tcp://localhost:62541/Quickstarts/ReferenceServer")
//!     .use_security(false)
//!     .durable_subscriptions(true)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.monitor.deadline, Some(Duration::from_secs(150)));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, SessionResult};
use crate::types::EndpointTarget;

/// Default endpoint of the OPC Foundation reference server.
pub const DEFAULT_ENDPOINT: &str = "opc.tcp://localhost:62541/Quickstarts/ReferenceServer";

// =============================================================================
// ReconnectPolicy
// =============================================================================

/// Exponential backoff for the non-durable reconnect path.
///
/// Delay after failed attempt `n` (1-based):
/// `min(base_period * multiplier^(n-1), max_period)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub base_period: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_period: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Consecutive failures after which the session is declared fatal.
    pub max_attempts: u32,

    /// Time bound of each individual attempt.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_period: Duration::from_secs(1),
            max_period: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl ReconnectPolicy {
    /// Sets the base period.
    pub fn with_base_period(mut self, period: Duration) -> Self {
        self.base_period = period;
        self
    }

    /// Sets the maximum period.
    pub fn with_max_period(mut self, period: Duration) -> Self {
        self.max_period = period;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Calculates the delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_period.as_millis() as f64;
        let multiplied = base * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = multiplied.min(self.max_period.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }

    /// Validates the policy.
    pub fn validate(&self) -> SessionResult<()> {
        if self.base_period.is_zero() {
            return Err(invalid("reconnect.base_period", "must be greater than zero"));
        }
        if self.max_period < self.base_period {
            return Err(invalid("reconnect.max_period", "must be at least the base period"));
        }
        if self.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be at least 1.0"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "must be at least 1"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(invalid("reconnect.attempt_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

// =============================================================================
// MonitorSettings
// =============================================================================

/// Checkpoints of the durable-subscription exercise.
///
/// Both offsets are measured from the start of the monitoring phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableSchedule {
    /// Close the channel (keeping the subscription) at this offset.
    #[serde(with = "humantime_serde")]
    pub close_after: Duration,

    /// Open a new channel and transfer the subscription at this offset.
    #[serde(with = "humantime_serde")]
    pub restart_after: Duration,
}

impl Default for DurableSchedule {
    fn default() -> Self {
        Self {
            close_after: Duration::from_secs(15),
            restart_after: Duration::from_secs(45),
        }
    }
}

/// Settings of the bounded wait loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Interval between health checks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Total monitoring time; `None` waits for the quit signal only.
    #[serde(default, with = "option_humantime_serde")]
    pub deadline: Option<Duration>,

    /// Durable transfer checkpoints; `None` disables durable mode.
    #[serde(default)]
    pub durable: Option<DurableSchedule>,

    /// Endpoint tried when the primary is unavailable during a transfer.
    #[serde(default)]
    pub fallback_endpoint: Option<EndpointTarget>,
}

impl MonitorSettings {
    /// Default deadline without durable subscriptions.
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(65);

    /// Default deadline with durable subscriptions.
    pub const DURABLE_DEADLINE: Duration = Duration::from_secs(150);

    /// Returns `true` when durable checkpoints are scheduled.
    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            deadline: Some(Self::DEFAULT_DEADLINE),
            durable: None,
            fallback_endpoint: None,
        }
    }
}

// =============================================================================
// BrowsePlan
// =============================================================================

/// Which address-space strategies to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowsePlan {
    /// Recursive browse, one round trip per node.
    pub full_browse: bool,
    /// Batched browse.
    pub managed_browse: bool,
    /// Node cache snapshot.
    pub fetch_all: bool,
    /// Read every discovered variable and print JSON.
    pub json_values: bool,
    /// Parents per managed-browse round trip.
    pub managed_batch_size: usize,
}

impl BrowsePlan {
    /// Returns `true` if any discovery strategy is selected.
    pub fn any(&self) -> bool {
        self.full_browse || self.managed_browse || self.fetch_all || self.json_values
    }
}

impl Default for BrowsePlan {
    fn default() -> Self {
        Self {
            full_browse: false,
            managed_browse: false,
            fetch_all: false,
            json_values: false,
            managed_batch_size: 16,
        }
    }
}

// =============================================================================
// SubscriptionDefaults
// =============================================================================

/// Parameters used when subscribing to sampled variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDefaults {
    /// Monitored item sampling interval.
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Subscription publishing interval.
    #[serde(with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Monitored item queue size.
    pub queue_size: u32,

    /// Lifetime count.
    pub lifetime_count: u32,

    /// Keep-alive count.
    pub keep_alive_count: u32,

    /// Maximum number of variables subscribed.
    pub max_variables: usize,

    /// Seed of the sampling generator.
    pub seed: u64,
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(100),
            publishing_interval: Duration::from_millis(1000),
            queue_size: 10,
            lifetime_count: 60,
            keep_alive_count: 2,
            max_variables: 1000,
            seed: 62541,
        }
    }
}

// =============================================================================
// ClientConfig
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to.
    pub endpoint: EndpointTarget,

    /// Time bound of the initial connect.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Wait loop.
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Address-space discovery.
    #[serde(default)]
    pub browse: BrowsePlan,

    /// Subscription parameters.
    #[serde(default)]
    pub subscription: SubscriptionDefaults,

    /// Subscribe to sampled variables after discovery.
    #[serde(default)]
    pub subscribe: bool,

    /// Write every notification to the output.
    #[serde(default)]
    pub verbose: bool,
}

impl ClientConfig {
    /// Creates a new builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SessionResult<()> {
        self.endpoint.validate()?;
        if let Some(fallback) = &self.monitor.fallback_endpoint {
            fallback.validate()?;
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "must be greater than zero"));
        }
        self.reconnect.validate()?;

        if self.monitor.poll_interval.is_zero() {
            return Err(invalid("monitor.poll_interval", "must be greater than zero"));
        }
        if let Some(schedule) = &self.monitor.durable {
            if schedule.close_after >= schedule.restart_after {
                return Err(invalid(
                    "monitor.durable",
                    "close checkpoint must come before the restart checkpoint",
                ));
            }
        }

        if self.browse.managed_batch_size == 0 {
            return Err(invalid("browse.managed_batch_size", "must be at least 1"));
        }

        let sub = &self.subscription;
        if sub.publishing_interval.is_zero() {
            return Err(invalid("subscription.publishing_interval", "must be greater than zero"));
        }
        if sub.keep_alive_count == 0 {
            return Err(invalid("subscription.keep_alive_count", "must be at least 1"));
        }
        if sub.lifetime_count < sub.keep_alive_count.saturating_mul(3) {
            return Err(invalid(
                "subscription.lifetime_count",
                "must be at least three times the keep-alive count",
            ));
        }
        if sub.max_variables == 0 {
            return Err(invalid("subscription.max_variables", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointTarget::new(DEFAULT_ENDPOINT),
            connect_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            monitor: MonitorSettings::default(),
            browse: BrowsePlan::default(),
            subscription: SubscriptionDefaults::default(),
            subscribe: false,
            verbose: false,
        }
    }
}

// =============================================================================
// ClientConfigBuilder
// =============================================================================

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    endpoint: Option<String>,
    use_security: Option<bool>,
    connect_timeout: Option<Duration>,
    reconnect: Option<ReconnectPolicy>,
    poll_interval: Option<Duration>,
    deadline: Option<Option<Duration>>,
    durable: bool,
    durable_schedule: Option<DurableSchedule>,
    fallback_endpoint: Option<String>,
    browse: BrowsePlan,
    subscription: Option<SubscriptionDefaults>,
    subscribe: bool,
    verbose: bool,
}

impl ClientConfigBuilder {
    /// Sets the server endpoint URL.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Enables or disables security.
    pub fn use_security(mut self, enabled: bool) -> Self {
        self.use_security = Some(enabled);
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the reconnect policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Sets the wait loop poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the monitoring deadline; `None` waits for quit only.
    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Enables durable subscriptions with the default checkpoints.
    pub fn durable_subscriptions(mut self, enabled: bool) -> Self {
        self.durable = enabled;
        self
    }

    /// Enables durable subscriptions with explicit checkpoints.
    pub fn durable_schedule(mut self, schedule: DurableSchedule) -> Self {
        self.durable = true;
        self.durable_schedule = Some(schedule);
        self
    }

    /// Sets the fallback endpoint used during a transfer.
    pub fn fallback_endpoint(mut self, url: impl Into<String>) -> Self {
        self.fallback_endpoint = Some(url.into());
        self
    }

    /// Sets the browse plan.
    pub fn browse(mut self, plan: BrowsePlan) -> Self {
        self.browse = plan;
        self
    }

    /// Sets the subscription defaults.
    pub fn subscription(mut self, defaults: SubscriptionDefaults) -> Self {
        self.subscription = Some(defaults);
        self
    }

    /// Subscribes to sampled variables after discovery.
    pub fn subscribe(mut self, enabled: bool) -> Self {
        self.subscribe = enabled;
        self
    }

    /// Writes every notification to the output.
    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> SessionResult<ClientConfig> {
        let use_security = self.use_security.unwrap_or(true);
        let endpoint = EndpointTarget::new(self.endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.into()))
            .with_security(use_security);

        let durable = if self.durable {
            Some(self.durable_schedule.unwrap_or_default())
        } else {
            None
        };
        let default_deadline = if durable.is_some() {
            MonitorSettings::DURABLE_DEADLINE
        } else {
            MonitorSettings::DEFAULT_DEADLINE
        };

        let monitor = MonitorSettings {
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(1)),
            deadline: self.deadline.unwrap_or(Some(default_deadline)),
            durable,
            fallback_endpoint: self
                .fallback_endpoint
                .map(|url| EndpointTarget::new(url).with_security(use_security)),
        };

        let config = ClientConfig {
            endpoint,
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(15)),
            reconnect: self.reconnect.unwrap_or_default(),
            monitor,
            browse: self.browse,
            subscription: self.subscription.unwrap_or_default(),
            subscribe: self.subscribe,
            verbose: self.verbose,
        };

        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::SessionError {
    ConfigurationError::invalid_value(field, reason).into()
}

// =============================================================================
// Serde helpers
// =============================================================================

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod option_humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| humantime::format_duration(d).to_string())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecurityMode;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=6).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder().build().unwrap();
        assert_eq!(config.endpoint.url(), DEFAULT_ENDPOINT);
        assert!(config.endpoint.uses_security());
        assert_eq!(config.monitor.deadline, Some(MonitorSettings::DEFAULT_DEADLINE));
        assert!(!config.monitor.is_durable());
        assert_eq!(config.subscription.seed, 62541);
        assert_eq!(config.subscription.max_variables, 1000);
    }

    #[test]
    fn test_builder_durable() {
        let config = ClientConfig::builder()
            .use_security(false)
            .durable_subscriptions(true)
            .build()
            .unwrap();
        assert_eq!(config.endpoint.security_mode(), SecurityMode::None);
        assert_eq!(config.monitor.deadline, Some(MonitorSettings::DURABLE_DEADLINE));
        assert_eq!(config.monitor.durable, Some(DurableSchedule::default()));
    }

    #[test]
    fn test_validation_errors() {
        assert!(ClientConfig::builder().endpoint("tcp://x").build().is_err());
        assert!(ClientConfig::builder()
            .durable_schedule(DurableSchedule {
                close_after: Duration::from_secs(45),
                restart_after: Duration::from_secs(15),
            })
            .build()
            .is_err());
        assert!(ClientConfig::builder()
            .reconnect(ReconnectPolicy::default().with_max_attempts(0))
            .build()
            .is_err());
        assert!(ClientConfig::builder()
            .poll_interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_humantime_roundtrip() {
        let config = ClientConfig::builder().durable_subscriptions(true).build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"poll_interval\":\"1s\""));
        assert!(json.contains("\"deadline\":\"2m 30s\""));
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
