//! Session policy: timers, retry limits, service type.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::DEFAULT_MAX_CHUNK;

/// Longest service type the advertiser accepts.
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Coordinator policy. Durations are milliseconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub service_type: String,
    pub display_name: String,
    /// Send device info as soon as a session connects.
    pub always_request_info: bool,
    pub auto_reconnect: bool,
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// No timeout means no heartbeat for this mesh.
    #[serde(with = "opt_millis")]
    pub ping_timeout: Option<Duration>,
    /// How long a peer stays `disconnected` before it is hidden.
    #[serde(with = "opt_millis")]
    pub hidden_grace: Option<Duration>,
    #[serde(with = "millis")]
    pub invite_cooldown: Duration,
    #[serde(with = "millis")]
    pub rsvp_interval: Duration,
    #[serde(with = "millis")]
    pub reinvite_delay: Duration,
    #[serde(with = "millis")]
    pub reconnect_ceiling: Duration,
    pub reconnect_multiplier: f64,
    #[serde(with = "millis")]
    pub invitation_timeout: Duration,
    #[serde(with = "millis")]
    pub info_retry_interval: Duration,
    pub info_retry_limit: u32,
    /// Rolling message history size; 0 disables it.
    pub history_limit: usize,
    pub max_stream_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_type: String::new(),
            display_name: String::new(),
            always_request_info: true,
            auto_reconnect: true,
            ping_interval: Duration::from_secs(3),
            ping_timeout: Some(Duration::from_secs(10)),
            hidden_grace: Some(Duration::from_secs(5)),
            invite_cooldown: Duration::from_secs(3),
            rsvp_interval: Duration::from_millis(200),
            reinvite_delay: Duration::from_millis(500),
            reconnect_ceiling: Duration::from_secs(20),
            reconnect_multiplier: 1.5,
            invitation_timeout: Duration::from_secs(30),
            info_retry_interval: Duration::from_secs(2),
            info_retry_limit: 3,
            history_limit: 0,
            max_stream_chunk: DEFAULT_MAX_CHUNK,
        }
    }
}

impl SessionConfig {
    pub fn new(service_type: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Check everything `start()` depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_type(&self.service_type)?;
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::MissingDisplayName);
        }
        if !(self.reconnect_multiplier >= 1.0) {
            return Err(ConfigError::InvalidMultiplier(self.reconnect_multiplier));
        }
        Ok(())
    }
}

/// Service types follow DNS-SD rules: 1-15 chars of `[a-z0-9-]`, at least one
/// letter, no leading, trailing or doubled hyphen.
pub fn validate_service_type(service_type: &str) -> Result<(), ConfigError> {
    if service_type.is_empty() {
        return Err(ConfigError::MissingServiceType);
    }
    let invalid = || ConfigError::InvalidServiceType(service_type.to_owned());
    if service_type.len() > MAX_SERVICE_TYPE_LEN {
        return Err(invalid());
    }
    if !service_type
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid());
    }
    if !service_type.bytes().any(|b| b.is_ascii_lowercase()) {
        return Err(invalid());
    }
    if service_type.starts_with('-') || service_type.ends_with('-') || service_type.contains("--")
    {
        return Err(invalid());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("service type is not set")]
    MissingServiceType,
    #[error("invalid service type {0:?}")]
    InvalidServiceType(String),
    #[error("display name is not set")]
    MissingDisplayName,
    #[error("reconnect multiplier {0} must be at least 1.0")]
    InvalidMultiplier(f64),
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let c = SessionConfig::default();
        assert!(c.always_request_info);
        assert_eq!(c.ping_interval, Duration::from_secs(3));
        assert_eq!(c.ping_timeout, Some(Duration::from_secs(10)));
        assert_eq!(c.hidden_grace, Some(Duration::from_secs(5)));
        assert_eq!(c.rsvp_interval, Duration::from_millis(200));
        assert_eq!(c.history_limit, 0);
    }

    #[test]
    fn service_type_rules() {
        for ok in ["nearby", "a", "mesh-2", "x1-y2-z3", "abcdefghijklmno"] {
            assert_eq!(validate_service_type(ok), Ok(()), "{ok}");
        }
        assert_eq!(validate_service_type(""), Err(ConfigError::MissingServiceType));
        for bad in ["Nearby", "-mesh", "mesh-", "me--sh", "1234", "abcdefghijklmnop", "me sh"] {
            assert!(
                matches!(validate_service_type(bad), Err(ConfigError::InvalidServiceType(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn validate_needs_name() {
        assert_eq!(
            SessionConfig::new("nearby", " ").validate(),
            Err(ConfigError::MissingDisplayName)
        );
        assert_eq!(SessionConfig::new("nearby", "Desk").validate(), Ok(()));
        let mut c = SessionConfig::new("nearby", "Desk");
        c.reconnect_multiplier = 0.5;
        assert_eq!(c.validate(), Err(ConfigError::InvalidMultiplier(0.5)));
    }

    #[test]
    fn json_uses_millis_and_defaults() {
        let c: SessionConfig = serde_json::from_str(
            r#"{"service_type":"nearby","ping_interval":1500,"ping_timeout":null}"#,
        )
        .unwrap();
        assert_eq!(c.ping_interval, Duration::from_millis(1500));
        assert_eq!(c.ping_timeout, None);
        assert_eq!(c.invite_cooldown, Duration::from_secs(3));
    }
}
