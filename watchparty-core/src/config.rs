use std::{env, time::Duration};

use log::warn;

/// The configuration shared by the synchronization and distribution managers
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a download waits for the transfer's metadata before giving up
    pub metadata_timeout: Duration,
    /// How often a download checks whether the first content unit is local
    pub content_poll_interval: Duration,
    /// How often transfer telemetry is sampled
    pub telemetry_interval: Duration,
    /// How often the relay is asked whether an ingest connection is established
    pub connection_poll_interval: Duration,
    /// How long a publisher waits for the relay to confirm the ingest connection
    pub connection_timeout: Duration,
    /// How often a participant re-announces its presence record
    pub presence_heartbeat_interval: Duration,
    /// How long a presence record survives without a heartbeat
    pub presence_timeout: Duration,
    /// How long a room lives after creation
    pub room_lifetime: Duration,
    /// The video source of rooms created without one
    pub default_video_source: String,
}

impl Config {
    /// Returns the default config with any `WATCHPARTY_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        override_secs("WATCHPARTY_METADATA_TIMEOUT", &mut config.metadata_timeout);
        override_secs(
            "WATCHPARTY_CONTENT_POLL_INTERVAL",
            &mut config.content_poll_interval,
        );
        override_secs(
            "WATCHPARTY_TELEMETRY_INTERVAL",
            &mut config.telemetry_interval,
        );
        override_secs(
            "WATCHPARTY_CONNECTION_POLL_INTERVAL",
            &mut config.connection_poll_interval,
        );
        override_secs(
            "WATCHPARTY_CONNECTION_TIMEOUT",
            &mut config.connection_timeout,
        );
        override_secs(
            "WATCHPARTY_PRESENCE_HEARTBEAT",
            &mut config.presence_heartbeat_interval,
        );
        override_secs("WATCHPARTY_PRESENCE_TIMEOUT", &mut config.presence_timeout);
        override_secs("WATCHPARTY_ROOM_LIFETIME", &mut config.room_lifetime);

        if let Ok(source) = env::var("WATCHPARTY_DEFAULT_VIDEO") {
            config.default_video_source = source;
        }

        config
    }

    /// The room lifetime as a chrono duration, for computing expiry timestamps
    pub fn room_lifetime_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.room_lifetime).unwrap_or(chrono::Duration::days(7))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Uploaders that went offline are the common case, so don't wait forever
            metadata_timeout: Duration::from_secs(60),
            content_poll_interval: Duration::from_secs(1),
            telemetry_interval: Duration::from_secs(1),
            connection_poll_interval: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(60),
            presence_heartbeat_interval: Duration::from_secs(15),
            presence_timeout: Duration::from_secs(30),
            room_lifetime: Duration::from_secs(60 * 60 * 24 * 7),
            default_video_source: "https://www.youtube.com/watch?v=19aPQJ2HYc8".to_string(),
        }
    }
}

fn override_secs(key: &str, target: &mut Duration) {
    let Ok(value) = env::var(key) else {
        return;
    };

    match value.parse::<f64>() {
        Ok(secs) if secs >= 0. => *target = Duration::from_secs_f64(secs),
        _ => warn!("Ignoring {}={}, expected a number of seconds", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recommended_intervals() {
        let config = Config::default();

        assert_eq!(config.metadata_timeout, Duration::from_secs(60));
        assert_eq!(config.telemetry_interval, Duration::from_secs(1));
        assert_eq!(config.connection_poll_interval, Duration::from_secs(2));
        assert!(config.presence_timeout > config.presence_heartbeat_interval);
    }

    #[test]
    fn test_env_override() {
        env::set_var("WATCHPARTY_CONNECTION_TIMEOUT", "12.5");
        env::set_var("WATCHPARTY_METADATA_TIMEOUT", "soon");

        let config = Config::from_env();

        env::remove_var("WATCHPARTY_CONNECTION_TIMEOUT");
        env::remove_var("WATCHPARTY_METADATA_TIMEOUT");

        assert_eq!(config.connection_timeout, Duration::from_secs_f64(12.5));
        assert_eq!(
            config.metadata_timeout,
            Duration::from_secs(60),
            "invalid values fall back to the default"
        );
    }
}
