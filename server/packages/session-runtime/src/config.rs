//! Runtime configuration.
//!
//! Precedence, lowest to highest: built-in defaults, an optional JSON file,
//! `SESSION_RUNTIME_*` environment variables, then CLI flags (applied by
//! the caller).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub summary: SummaryConfig,
    pub hub: HubConfig,
    pub coordinator: CoordinatorConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(with = "duration_str")]
    pub max_idle_time: Duration,
    #[serde(with = "duration_str")]
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub global_requests_per_second: f64,
    pub global_burst: u32,
    pub user_requests_per_second: f64,
    pub user_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_requests_per_second: 100.0,
            global_burst: 150,
            user_requests_per_second: 10.0,
            user_burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub enabled: bool,
    /// Recent rounds kept verbatim; older rounds are folded into the summary.
    pub max_recent_rounds: usize,
    pub max_summary_tokens: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_recent_rounds: 10,
            max_summary_tokens: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseBehavior {
    /// Send a final `close` event before ending the stream.
    Signal,
    /// End the stream without a terminal event.
    Silent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Zero disables the heartbeat.
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_str")]
    pub write_timeout: Duration,
    pub channel_capacity: usize,
    pub close_behavior: CloseBehavior,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            channel_capacity: 64,
            close_behavior: CloseBehavior::Signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Fail immediately when no token is available.
    Reject,
    /// Wait up to `admission_timeout` for a token.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFailurePolicy {
    /// Log and continue with empty (on load) or unsaved (on save) memory.
    Degrade,
    /// Fail the exchange with a persistence error.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub admission: AdmissionMode,
    #[serde(with = "duration_str")]
    pub admission_timeout: Duration,
    #[serde(with = "duration_str")]
    pub execution_timeout: Duration,
    pub memory_failure: MemoryFailurePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionMode::Reject,
            admission_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(120),
            memory_failure: MemoryFailurePolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub directory: Option<PathBuf>,
    #[serde(with = "duration_str::option")]
    pub expiration: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            directory: None,
            expiration: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl StoreConfig {
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("session-runtime").join("conversations"))
                .unwrap_or_else(|| {
                    PathBuf::from(".")
                        .join(".session-runtime")
                        .join("conversations")
                })
        })
    }
}

impl RuntimeConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `SESSION_RUNTIME_*` overrides. Unparseable values are logged
    /// and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = EnvOverrides { lookup: &lookup };
        env.duration("SESSION_RUNTIME_MAX_IDLE_TIME", &mut self.pool.max_idle_time);
        env.duration(
            "SESSION_RUNTIME_CLEANUP_INTERVAL",
            &mut self.pool.cleanup_interval,
        );
        env.parse("SESSION_RUNTIME_RATE_LIMIT_ENABLED", &mut self.rate_limit.enabled);
        env.parse(
            "SESSION_RUNTIME_GLOBAL_RPS",
            &mut self.rate_limit.global_requests_per_second,
        );
        env.parse("SESSION_RUNTIME_GLOBAL_BURST", &mut self.rate_limit.global_burst);
        env.parse(
            "SESSION_RUNTIME_USER_RPS",
            &mut self.rate_limit.user_requests_per_second,
        );
        env.parse("SESSION_RUNTIME_USER_BURST", &mut self.rate_limit.user_burst);
        env.parse(
            "SESSION_RUNTIME_MAX_RECENT_ROUNDS",
            &mut self.summary.max_recent_rounds,
        );
        env.duration(
            "SESSION_RUNTIME_HEARTBEAT_INTERVAL",
            &mut self.hub.heartbeat_interval,
        );
        env.duration(
            "SESSION_RUNTIME_EXECUTION_TIMEOUT",
            &mut self.coordinator.execution_timeout,
        );
        if let Some(dir) = lookup("SESSION_RUNTIME_STORE_DIR").filter(|v| !v.trim().is_empty()) {
            self.store.backend = StoreBackend::File;
            self.store.directory = Some(PathBuf::from(dir.trim()));
        }
    }
}

struct EnvOverrides<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvOverrides<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, target: &mut T) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key = key, value = %raw, "ignoring invalid env override"),
        }
    }

    fn duration(&self, key: &str, target: &mut Duration) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match duration_str::parse(&raw) {
            Some(value) => *target = value,
            None => tracing::warn!(key = key, value = %raw, "ignoring invalid env override"),
        }
    }
}

/// Human-readable durations: `"250ms"`, `"5s"`, `"30m"`, `"1h30m"`, `"2d"`,
/// or a bare integer number of seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<Duration> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut rest = raw;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit())?;
            if digits == 0 {
                return None;
            }
            let value: u64 = rest[..digits].parse().ok()?;
            rest = &rest[digits..];
            let unit_len = rest
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(rest.len());
            let unit = match &rest[..unit_len] {
                "ns" => Duration::from_nanos(value),
                "us" | "µs" => Duration::from_micros(value),
                "ms" => Duration::from_millis(value),
                "s" => Duration::from_secs(value),
                "m" => Duration::from_secs(value.checked_mul(60)?),
                "h" => Duration::from_secs(value.checked_mul(60 * 60)?),
                "d" => Duration::from_secs(value.checked_mul(24 * 60 * 60)?),
                _ => return None,
            };
            total = total.checked_add(unit)?;
            rest = &rest[unit_len..];
        }
        Some(total)
    }

    /// Largest unit that represents `duration` exactly, so `parse` always
    /// reads the same value back.
    pub fn format(duration: Duration) -> String {
        let nanos = duration.as_nanos();
        if nanos % 1_000 != 0 {
            return format!("{nanos}ns");
        }
        if nanos % 1_000_000 != 0 {
            return format!("{}us", nanos / 1_000);
        }
        if nanos % 1_000_000_000 != 0 {
            return format!("{}ms", nanos / 1_000_000);
        }
        let secs = duration.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a duration such as \"30s\" or an integer number of seconds")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse(value).ok_or_else(|| E::custom(format!("invalid duration `{value}`")))
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => serializer.serialize_some(&super::format(*duration)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Duration);

            let wrapper = Option::<Wrapper>::deserialize(deserializer)?;
            Ok(wrapper.map(|Wrapper(duration)| duration))
        }
    }
}
