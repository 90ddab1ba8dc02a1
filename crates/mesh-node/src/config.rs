//! Mesh node configuration.
//!
//! Configuration is loaded from environment variables. The store URL is held
//! as a `SecretString` and redacted in Debug output.
//!
//! [`SessionConfig`] is the library-facing subset used by
//! [`MeetingSession`](crate::session::MeetingSession); its `Default` carries the
//! design values (5s heartbeat, 12s ghost timeout, 2s sampling).

use crate::quality::QualityThresholds;
use common::secret::SecretString;
use common::types::MemberId;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default room identifier.
pub const DEFAULT_ROOM_ID: &str = "teamspace-main-room";

/// Default display name when the identity service supplies none.
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// Default room capacity.
pub const DEFAULT_ROOM_CAPACITY: u32 = 3;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default ghost timeout. Gives a 2.4x margin over the heartbeat.
pub const DEFAULT_GHOST_TIMEOUT_MS: u64 = 12_000;

/// Default ghost sweep interval.
pub const DEFAULT_GHOST_SWEEP_INTERVAL_MS: u64 = 5_000;

/// Default link statistics sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 2_000;

/// Default time a link may spend offering or answering before it is dropped.
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;

/// Default duration of the "connected" confirmation after a reconnect.
pub const DEFAULT_CONNECTED_NOTICE_MS: u64 = 3_000;

/// Default admission transaction attempts before giving up.
pub const DEFAULT_TXN_MAX_ATTEMPTS: u32 = 8;

/// Default base backoff between admission transaction attempts.
pub const DEFAULT_TXN_BASE_BACKOFF_MS: u64 = 20;

/// Backoff ceiling for admission transactions.
pub const DEFAULT_TXN_MAX_BACKOFF_MS: u64 = 1_000;

/// Default signal write/delete attempts.
pub const DEFAULT_SIGNAL_WRITE_ATTEMPTS: u32 = 3;

/// Default base backoff between signal write attempts.
pub const DEFAULT_SIGNAL_BASE_BACKOFF_MS: u64 = 50;

/// Default ICE servers (comma separated).
pub const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Admission transaction defaults.
    pub fn transaction() -> Self {
        Self {
            max_attempts: DEFAULT_TXN_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_TXN_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_TXN_MAX_BACKOFF_MS),
        }
    }

    /// Signal write defaults.
    pub fn signaling() -> Self {
        Self {
            max_attempts: DEFAULT_SIGNAL_WRITE_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_SIGNAL_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_TXN_MAX_BACKOFF_MS),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Session tuning used by the library.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum simultaneous members (`N`).
    pub room_capacity: u32,

    /// Heartbeat period (`H`).
    pub heartbeat_interval: Duration,

    /// Staleness after which a member is a ghost (`G`); must exceed `H`.
    pub ghost_timeout: Duration,

    /// Periodic ghost sweep interval.
    pub ghost_sweep_interval: Duration,

    /// Link statistics sampling interval (`S`).
    pub sample_interval: Duration,

    /// Offering or answering links older than this are torn down and
    /// renegotiated.
    pub negotiation_timeout: Duration,

    /// How long the "connected" confirmation stays up after a reconnect.
    pub connected_notice: Duration,

    pub quality: QualityThresholds,

    pub admission_retry: RetryPolicy,

    pub signal_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_capacity: DEFAULT_ROOM_CAPACITY,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            ghost_timeout: Duration::from_millis(DEFAULT_GHOST_TIMEOUT_MS),
            ghost_sweep_interval: Duration::from_millis(DEFAULT_GHOST_SWEEP_INTERVAL_MS),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            negotiation_timeout: Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS),
            connected_notice: Duration::from_millis(DEFAULT_CONNECTED_NOTICE_MS),
            quality: QualityThresholds::default(),
            admission_retry: RetryPolicy::transaction(),
            signal_retry: RetryPolicy::signaling(),
        }
    }
}

impl SessionConfig {
    /// Reject combinations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "room capacity must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero()
            || self.ghost_sweep_interval.is_zero()
            || self.sample_interval.is_zero()
            || self.negotiation_timeout.is_zero()
        {
            return Err(ConfigError::InvalidValue(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        if self.ghost_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidValue(format!(
                "ghost timeout ({}ms) must exceed heartbeat interval ({}ms)",
                self.ghost_timeout.as_millis(),
                self.heartbeat_interval.as_millis()
            )));
        }
        if self.quality.weak_loss >= self.quality.bad_loss {
            return Err(ConfigError::InvalidValue(format!(
                "weak loss threshold ({}) must be below bad loss threshold ({})",
                self.quality.weak_loss, self.quality.bad_loss
            )));
        }
        if self.admission_retry.max_attempts == 0 || self.signal_retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Ghost timeout expressed as a multiple of the heartbeat interval.
    pub fn ghost_margin(&self) -> f64 {
        self.ghost_timeout.as_secs_f64() / self.heartbeat_interval.as_secs_f64()
    }
}

/// Mesh node configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (document store).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Room scoping every store key (default: "teamspace-main-room").
    pub room_id: String,

    /// Stable identifier supplied by the identity service.
    pub member_id: MemberId,

    /// Caller-supplied display name.
    pub display_name: String,

    /// ICE servers handed to the peer transport.
    pub ice_servers: Vec<String>,

    /// Capture a local audio track.
    pub audio_enabled: bool,

    /// Capture a local video track.
    pub video_enabled: bool,

    /// Health endpoint bind address (default: "0.0.0.0:8082").
    pub health_bind_address: String,

    pub session: SessionConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("room_id", &self.room_id)
            .field("member_id", &self.member_id)
            .field("display_name", &self.display_name)
            .field("ice_servers", &self.ice_servers)
            .field("audio_enabled", &self.audio_enabled)
            .field("video_enabled", &self.video_enabled)
            .field("health_bind_address", &self.health_bind_address)
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let room_id = non_empty(vars, "MESH_ROOM_ID").unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());

        let member_id = non_empty(vars, "MESH_MEMBER_ID")
            .map(MemberId::from)
            .unwrap_or_else(MemberId::random);

        let display_name = non_empty(vars, "MESH_DISPLAY_NAME")
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        let ice_servers: Vec<String> = vars
            .get("MESH_ICE_SERVERS")
            .map_or(DEFAULT_ICE_SERVERS, String::as_str)
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();

        let health_bind_address = vars
            .get("MESH_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let audio_enabled = parse_var(vars, "MESH_AUDIO_ENABLED", true)?;
        let video_enabled = parse_var(vars, "MESH_VIDEO_ENABLED", true)?;

        let session = SessionConfig {
            room_capacity: parse_var(vars, "MESH_ROOM_CAPACITY", DEFAULT_ROOM_CAPACITY)?,
            heartbeat_interval: parse_millis(
                vars,
                "MESH_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )?,
            ghost_timeout: parse_millis(vars, "MESH_GHOST_TIMEOUT_MS", DEFAULT_GHOST_TIMEOUT_MS)?,
            ghost_sweep_interval: parse_millis(
                vars,
                "MESH_GHOST_SWEEP_INTERVAL_MS",
                DEFAULT_GHOST_SWEEP_INTERVAL_MS,
            )?,
            sample_interval: parse_millis(
                vars,
                "MESH_SAMPLE_INTERVAL_MS",
                DEFAULT_SAMPLE_INTERVAL_MS,
            )?,
            negotiation_timeout: parse_millis(
                vars,
                "MESH_NEGOTIATION_TIMEOUT_MS",
                DEFAULT_NEGOTIATION_TIMEOUT_MS,
            )?,
            connected_notice: parse_millis(
                vars,
                "MESH_CONNECTED_NOTICE_MS",
                DEFAULT_CONNECTED_NOTICE_MS,
            )?,
            quality: QualityThresholds {
                weak_loss: parse_var(
                    vars,
                    "MESH_LOSS_WEAK_THRESHOLD",
                    QualityThresholds::DEFAULT_WEAK_LOSS,
                )?,
                bad_loss: parse_var(
                    vars,
                    "MESH_LOSS_BAD_THRESHOLD",
                    QualityThresholds::DEFAULT_BAD_LOSS,
                )?,
                speaking_threshold: parse_var(
                    vars,
                    "MESH_SPEAKING_THRESHOLD",
                    QualityThresholds::DEFAULT_SPEAKING_THRESHOLD,
                )?,
            },
            admission_retry: RetryPolicy {
                max_attempts: parse_var(vars, "MESH_TXN_MAX_ATTEMPTS", DEFAULT_TXN_MAX_ATTEMPTS)?,
                base_backoff: parse_millis(
                    vars,
                    "MESH_TXN_BASE_BACKOFF_MS",
                    DEFAULT_TXN_BASE_BACKOFF_MS,
                )?,
                max_backoff: Duration::from_millis(DEFAULT_TXN_MAX_BACKOFF_MS),
            },
            signal_retry: RetryPolicy {
                max_attempts: parse_var(
                    vars,
                    "MESH_SIGNAL_WRITE_ATTEMPTS",
                    DEFAULT_SIGNAL_WRITE_ATTEMPTS,
                )?,
                ..RetryPolicy::signaling()
            },
        };
        session.validate()?;

        Ok(Config {
            redis_url,
            room_id,
            member_id,
            display_name,
            ice_servers,
            audio_enabled,
            video_enabled,
            health_bind_address,
            session,
        })
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}={raw}: {e}"))),
    }
}

fn parse_millis(
    vars: &HashMap<String, String>,
    key: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_var(vars, key, default_ms).map(Duration::from_millis)
}
