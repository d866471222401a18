use std::{collections::BTreeMap, time::Duration};

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{Client, Engine, Error, Result};

/// Configuration for [`Client`].
///
/// The connection settings are not used by the evaluation core itself. They are held here for the
/// [`UpdateSource`](crate::UpdateSource) that keeps rulesets current.
///
/// ```
/// # use switch_sdk::{ClientConfig, DriverKind};
/// let mut config = ClientConfig::new();
/// config
///     .domain("http://127.0.0.1:8081")
///     .namespace_tag("test-ns")
///     .env_tag("pre")
///     .replace_validation_timeout(DriverKind::Kafka, "30s");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Base URL of the switch server. Required.
    pub domain: String,
    /// Namespace tag (not the display name). Required.
    pub namespace_tag: String,
    /// Environment tag (not the display name). Required.
    pub env_tag: String,
    /// Name of the service embedding the client.
    pub service_name: String,
    /// Version of the service embedding the client.
    pub version: String,

    /// Protocol version announced by the client.
    pub client_version: String,
    /// Extra headers sent when connecting.
    pub request_header: BTreeMap<String, String>,
    /// How transports reconnect after losing the server.
    pub reconnect_strategy: ReconnectStrategy,
    /// Interval between heartbeats. Zero means unset.
    #[serde(with = "duration_str")]
    pub heartbeat: Duration,
    /// Websocket write timeout.
    #[serde(with = "duration_str")]
    pub write_timeout: Duration,
    /// Websocket read timeout.
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    /// Connect timeout.
    #[serde(with = "duration_str")]
    pub dial_timeout: Duration,

    /// Hot-swap parameters per driver kind.
    pub drivers: BTreeMap<DriverKind, DriverReplaceConfig>,
    /// Whether the kafka driver verifies broker identity before trusting a replacement driver.
    pub kafka_verify_brokers: bool,
}

/// Kind of transport driver delivering ruleset updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Updates consumed from a kafka topic.
    Kafka,
    /// Updates pushed to an HTTP endpoint of the host.
    Webhook,
    /// Updates fetched periodically.
    Polling,
}

impl DriverKind {
    /// Every driver kind, in declaration order.
    pub const ALL: [DriverKind; 3] = [DriverKind::Kafka, DriverKind::Webhook, DriverKind::Polling];
}

/// Parameters used when a driver is replaced by a newly delivered one.
///
/// Both values are duration strings such as `"60s"` or `"1m30s"`, parsed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverReplaceConfig {
    /// How long a replacement driver has to prove it works.
    pub validation_timeout: String,
    /// How long a replacement driver must stay healthy before the old one is released.
    pub stability_period: String,
}

impl ClientConfig {
    /// Default for [`ClientConfig::client_version`].
    pub const DEFAULT_CLIENT_VERSION: &'static str = "1.0.0";
    /// Default for [`ClientConfig::heartbeat`].
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
    /// Default for [`ClientConfig::write_timeout`].
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1000);
    /// Default for [`ClientConfig::read_timeout`].
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2000);
    /// Default for [`ClientConfig::dial_timeout`].
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default validation timeout of a replacement driver.
    pub const DEFAULT_VALIDATION_TIMEOUT: &'static str = "60s";
    /// Default stability period of a replacement driver.
    pub const DEFAULT_STABILITY_PERIOD: &'static str = "5s";

    /// Create an empty configuration. Defaults are filled in by [`Client::new`].
    pub fn new() -> ClientConfig {
        ClientConfig::default()
    }

    /// Set the base URL of the switch server.
    pub fn domain(&mut self, domain: impl Into<String>) -> &mut Self {
        self.domain = domain.into();
        self
    }

    /// Set the namespace tag.
    pub fn namespace_tag(&mut self, namespace_tag: impl Into<String>) -> &mut Self {
        self.namespace_tag = namespace_tag.into();
        self
    }

    /// Set the environment tag.
    pub fn env_tag(&mut self, env_tag: impl Into<String>) -> &mut Self {
        self.env_tag = env_tag.into();
        self
    }

    /// Set the name of the embedding service.
    pub fn service_name(&mut self, service_name: impl Into<String>) -> &mut Self {
        self.service_name = service_name.into();
        self
    }

    /// Set the version of the embedding service.
    pub fn version(&mut self, version: impl Into<String>) -> &mut Self {
        self.version = version.into();
        self
    }

    /// Override the announced protocol version.
    pub fn client_version(&mut self, client_version: impl Into<String>) -> &mut Self {
        self.client_version = client_version.into();
        self
    }

    /// Add a header sent when connecting.
    pub fn request_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.request_header.insert(name.into(), value.into());
        self
    }

    /// Set the reconnect policy.
    pub fn reconnect_strategy(&mut self, reconnect_strategy: ReconnectStrategy) -> &mut Self {
        self.reconnect_strategy = reconnect_strategy;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat(&mut self, heartbeat: Duration) -> &mut Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the websocket write timeout.
    pub fn write_timeout(&mut self, write_timeout: Duration) -> &mut Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Set the websocket read timeout.
    pub fn read_timeout(&mut self, read_timeout: Duration) -> &mut Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set the connect timeout.
    pub fn dial_timeout(&mut self, dial_timeout: Duration) -> &mut Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Set how long a replacement driver of `kind` has to prove it works.
    pub fn replace_validation_timeout(
        &mut self,
        kind: DriverKind,
        timeout: impl Into<String>,
    ) -> &mut Self {
        self.drivers.entry(kind).or_default().validation_timeout = timeout.into();
        self
    }

    /// Set how long a replacement driver of `kind` must stay healthy.
    pub fn replace_stability_period(
        &mut self,
        kind: DriverKind,
        period: impl Into<String>,
    ) -> &mut Self {
        self.drivers.entry(kind).or_default().stability_period = period.into();
        self
    }

    /// Verify broker identity before trusting a replacement kafka driver.
    pub fn kafka_verify_brokers(&mut self, verify: bool) -> &mut Self {
        self.kafka_verify_brokers = verify;
        self
    }

    /// Parsed validation timeout of replacement drivers of `kind`.
    pub fn validation_timeout(&self, kind: DriverKind) -> Result<Duration> {
        parse_duration(
            self.drivers
                .get(&kind)
                .map(|driver| driver.validation_timeout.as_str())
                .unwrap_or_default(),
        )
    }

    /// Parsed stability period of replacement drivers of `kind`.
    pub fn stability_period(&self, kind: DriverKind) -> Result<Duration> {
        parse_duration(
            self.drivers
                .get(&kind)
                .map(|driver| driver.stability_period.as_str())
                .unwrap_or_default(),
        )
    }

    /// Create a new [`Client`] evaluating switches with `engine`.
    pub fn to_client(self, engine: Engine) -> Client {
        Client::new(self, engine)
    }

    /// Fill in every unset option.
    pub(crate) fn apply_defaults(&mut self) {
        if self.client_version.is_empty() {
            self.client_version = ClientConfig::DEFAULT_CLIENT_VERSION.to_owned();
        }
        for (value, default) in [
            (&mut self.heartbeat, ClientConfig::DEFAULT_HEARTBEAT),
            (&mut self.write_timeout, ClientConfig::DEFAULT_WRITE_TIMEOUT),
            (&mut self.read_timeout, ClientConfig::DEFAULT_READ_TIMEOUT),
            (&mut self.dial_timeout, ClientConfig::DEFAULT_DIAL_TIMEOUT),
        ] {
            if value.is_zero() {
                *value = default;
            }
        }

        for kind in DriverKind::ALL {
            let driver = self.drivers.entry(kind).or_default();
            default_duration_str(
                kind,
                "validation_timeout",
                &mut driver.validation_timeout,
                ClientConfig::DEFAULT_VALIDATION_TIMEOUT,
            );
            default_duration_str(
                kind,
                "stability_period",
                &mut driver.stability_period,
                ClientConfig::DEFAULT_STABILITY_PERIOD,
            );
        }
    }

    /// Check the options required to connect.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::MissingOption("domain"));
        }
        if self.namespace_tag.is_empty() {
            return Err(Error::MissingOption("namespace_tag"));
        }
        if self.env_tag.is_empty() {
            return Err(Error::MissingOption("env_tag"));
        }
        url::Url::parse(&self.domain).map_err(Error::InvalidDomain)?;
        Ok(())
    }
}

/// Replace `value` by `default` unless it is a positive duration.
fn default_duration_str(kind: DriverKind, option: &str, value: &mut String, default: &str) {
    let rejected = match parse_duration(value) {
        Ok(duration) if !duration.is_zero() => return,
        Ok(_) => "duration must be positive".to_owned(),
        Err(err) => err.to_string(),
    };
    if !value.is_empty() {
        log::debug!(target: "switch",
            driver:debug = kind,
            option,
            value = value.as_str();
            "invalid driver option, using default: {rejected}");
    }
    *value = default.to_owned();
}

/// Backoff policy for re-establishing a lost connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectStrategy {
    /// Maximum number of attempts; negative means unlimited.
    pub max_retries: i32,
    /// Delay before the first retry.
    #[serde(with = "duration_str")]
    pub initial_delay: Duration,
    /// Upper bound of any delay.
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Connected time after which the attempt counter starts over.
    #[serde(with = "duration_str")]
    pub reset_interval: Duration,
    /// Shorten each delay by a random amount of up to 20%.
    pub enable_jitter: bool,
}

impl Default for ReconnectStrategy {
    fn default() -> ReconnectStrategy {
        ReconnectStrategy {
            max_retries: -1,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            reset_interval: Duration::from_secs(5 * 60),
            enable_jitter: true,
        }
    }
}

impl ReconnectStrategy {
    /// Returns `true` if attempt number `attempt` (starting at 0) is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries < 0 || i64::from(attempt) < i64::from(self.max_retries)
    }

    /// Delay before attempt number `attempt` (starting at 0).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));

        if self.enable_jitter {
            delay - jitter(delay.mul_f64(0.2))
        } else {
            delay
        }
    }
}

/// A random duration up to `max`.
fn jitter(max: Duration) -> Duration {
    thread_rng().gen_range(Duration::ZERO..=max)
}

/// Parse a duration string such as `"300ms"`, `"1.5s"` or `"1h15m"`.
///
/// The input is a sequence of decimal numbers, each with an optional fraction and a unit suffix.
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `"0"` is accepted.
/// Negative durations are rejected.
///
/// ```
/// # use std::time::Duration;
/// # use switch_sdk::parse_duration;
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
/// assert!(parse_duration("ten seconds").is_err());
/// ```
pub fn parse_duration(value: &str) -> Result<Duration> {
    let invalid = |reason: &'static str| Error::InvalidDuration {
        value: value.to_owned(),
        reason,
    };

    let mut rest = value.strip_prefix('+').unwrap_or(value);
    if rest.starts_with('-') {
        return Err(invalid("negative durations are not supported"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (integer, after) = split_digits(rest);
        let (fraction, after) = match after.strip_prefix('.') {
            Some(after) => split_digits(after),
            None => ("", after),
        };
        if integer.is_empty() && fraction.is_empty() {
            return Err(invalid("expected a number"));
        }

        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, after) = after.split_at(unit_len);
        let unit: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 60 * 60 * 1_000_000_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        let integer: u128 = if integer.is_empty() {
            0
        } else {
            integer.parse().map_err(|_| invalid("duration out of range"))?
        };
        let mut nanos = integer
            .checked_mul(unit)
            .ok_or_else(|| invalid("duration out of range"))?;

        // Digits past nanosecond precision are dropped.
        let fraction = &fraction[..fraction.len().min(18)];
        if !fraction.is_empty() {
            let scale = 10u128.pow(fraction.len() as u32);
            let fraction: u128 = fraction
                .parse()
                .map_err(|_| invalid("duration out of range"))?;
            nanos += fraction * unit / scale;
        }

        total = total
            .checked_add(nanos)
            .ok_or_else(|| invalid("duration out of range"))?;
        rest = after;
    }

    let total = u64::try_from(total).map_err(|_| invalid("duration out of range"))?;
    Ok(Duration::from_nanos(total))
}

fn split_digits(s: &str) -> (&str, &str) {
    s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()))
}

/// Durations as strings in [`parse_duration`] syntax.
mod duration_str {
    use std::time::Duration;

    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = duration.as_nanos();
        let formatted = if nanos == 0 {
            "0s".to_owned()
        } else if nanos % 1_000_000_000 == 0 {
            format!("{}s", nanos / 1_000_000_000)
        } else if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}us", nanos / 1_000)
        } else {
            format!("{nanos}ns")
        };
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        super::parse_duration(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{parse_duration, ClientConfig, DriverKind, ReconnectStrategy};
    use crate::Error;

    #[test]
    fn parses_duration_strings() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(".5m").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10µs").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("42ns").unwrap(), Duration::from_nanos(42));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("+2s").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_invalid_duration_strings() {
        for value in ["", "60", "s", ".s", "10 s", "-5s", "1d", "5s3", "99999999999999999999h"] {
            assert!(
                matches!(parse_duration(value), Err(Error::InvalidDuration { .. })),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn applies_defaults() {
        let mut config = ClientConfig::new();
        config
            .heartbeat(Duration::from_secs(5))
            .replace_validation_timeout(DriverKind::Kafka, "30s")
            .replace_stability_period(DriverKind::Kafka, "not a duration")
            .replace_stability_period(DriverKind::Webhook, "0s");
        config.apply_defaults();

        assert_eq!(config.client_version, "1.0.0");
        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_secs(1000));
        assert_eq!(config.read_timeout, Duration::from_secs(2000));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));

        assert_eq!(
            config.validation_timeout(DriverKind::Kafka).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.stability_period(DriverKind::Kafka).unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.stability_period(DriverKind::Webhook).unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.validation_timeout(DriverKind::Polling).unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn unset_driver_options_do_not_parse() {
        let config = ClientConfig::new();
        assert!(config.validation_timeout(DriverKind::Webhook).is_err());
    }

    #[test]
    fn validates_required_options() {
        let mut config = ClientConfig::new();
        assert!(matches!(config.validate(), Err(Error::MissingOption("domain"))));

        config.domain("http://127.0.0.1:8081");
        assert!(matches!(
            config.validate(),
            Err(Error::MissingOption("namespace_tag"))
        ));

        config.namespace_tag("test-ns").env_tag("pre");
        assert!(config.validate().is_ok());

        config.domain("not a url");
        assert!(matches!(config.validate(), Err(Error::InvalidDomain(_))));
    }

    #[test]
    fn reconnect_backoff() {
        let strategy = ReconnectStrategy {
            enable_jitter: false,
            ..ReconnectStrategy::default()
        };
        assert_eq!(strategy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(strategy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(strategy.delay_for_attempt(500), Duration::from_secs(10));
        assert!(strategy.should_retry(u32::MAX));

        let limited = ReconnectStrategy {
            max_retries: 3,
            ..strategy
        };
        assert!(limited.should_retry(2));
        assert!(!limited.should_retry(3));
    }

    #[test]
    fn reconnect_jitter_shortens_delay_by_at_most_a_fifth() {
        let strategy = ReconnectStrategy::default();
        for _ in 0..100 {
            let delay = strategy.delay_for_attempt(2);
            assert!(delay <= Duration::from_secs(4));
            assert!(delay >= Duration::from_millis(3200));
        }
    }

    #[test]
    fn deserializes_from_json() {
        let config: ClientConfig = serde_json::from_value(json!({
            "domain": "http://127.0.0.1:8081",
            "namespaceTag": "test-ns",
            "envTag": "pre",
            "heartbeat": "15s",
            "reconnectStrategy": {"maxRetries": 5, "initialDelay": "500ms"},
            "drivers": {"kafka": {"validationTimeout": "90s"}},
            "kafkaVerifyBrokers": true
        }))
        .unwrap();

        assert_eq!(config.heartbeat, Duration::from_secs(15));
        assert_eq!(config.reconnect_strategy.max_retries, 5);
        assert_eq!(
            config.reconnect_strategy.initial_delay,
            Duration::from_millis(500)
        );
        assert_eq!(config.reconnect_strategy.max_delay, Duration::from_secs(10));
        assert_eq!(
            config.validation_timeout(DriverKind::Kafka).unwrap(),
            Duration::from_secs(90)
        );
        assert!(config.kafka_verify_brokers);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["heartbeat"], json!("15s"));
        assert_eq!(value["reconnectStrategy"]["initialDelay"], json!("500ms"));
    }
}
