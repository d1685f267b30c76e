//! cutover.toml configuration parser.
//!
//! The file keeps every setting optional; [`CutoverConfig::environment`]
//! resolves one `[environments.<name>]` table into an [`Environment`] with
//! defaults applied and values validated.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_KEEP: u32 = 5;
pub const DEFAULT_FETCH_RETRIES: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no environments defined")]
    NoEnvironments,
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
    #[error("several environments defined ({0}); pass --env")]
    AmbiguousEnvironment(String),
    #[error("environment {env}: {reason}")]
    Invalid { env: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CutoverConfig {
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Absolute path of the environment root (releases/, shared/, current).
    pub root: String,
    /// Retired releases kept for rollback.
    pub keep: Option<u32>,
    pub fetch_retries: Option<u32>,
    pub steps: Option<StepsConfig>,
    pub shared: Option<SharedConfig>,
    pub health: Option<HealthConfig>,
    pub supervisor: Option<SupervisorConfig>,
    pub timeouts: Option<TimeoutsConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepsConfig {
    pub fetch: Option<Vec<String>>,
    pub install: Option<Vec<String>>,
    pub migrate: Option<Vec<String>>,
    pub warm: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedConfig {
    pub paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    pub pre_check: Option<Vec<String>>,
    pub pre_check_timeout: Option<String>,
    /// `http://host:port/path` or `command:<shell>`.
    pub liveness: Option<String>,
    pub probe_timeout: Option<String>,
    pub interval: Option<String>,
    pub window: Option<String>,
    pub required_successes: Option<u32>,
    pub maintenance: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub reload: Option<Vec<String>>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub transfer: Option<String>,
    pub step: Option<String>,
}

/// A fully resolved environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub name: String,
    pub root: PathBuf,
    pub keep: u32,
    pub fetch_retries: u32,
    pub steps: Steps,
    pub shared_paths: Vec<String>,
    pub health: GateSettings,
    pub supervisor: SupervisorSettings,
    pub transfer_timeout: Duration,
    pub step_timeout: Duration,
}

/// Commands for each preparation step. An empty `fetch` selects the built-in fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Steps {
    pub fetch: Vec<String>,
    pub install: Vec<String>,
    pub migrate: Vec<String>,
    pub warm: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateSettings {
    pub pre_check: Vec<String>,
    pub pre_check_timeout: Duration,
    pub liveness: Liveness,
    pub probe_timeout: Duration,
    pub interval: Duration,
    pub window: Duration,
    pub required_successes: u32,
    pub maintenance: bool,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            pre_check: Vec::new(),
            pre_check_timeout: Duration::from_secs(30),
            liveness: Liveness::None,
            probe_timeout: Duration::from_secs(2),
            interval: Duration::from_secs(1),
            window: Duration::from_secs(30),
            required_successes: 3,
            maintenance: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub reload: Vec<String>,
    pub timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            reload: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Liveness signal polled after promotion.
#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    None,
    Http { address: String, path: String },
    Command(String),
}

impl Liveness {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Liveness::None);
        }
        if let Some(cmd) = spec.strip_prefix("command:") {
            let cmd = cmd.trim();
            if cmd.is_empty() {
                return Err("liveness command is empty".to_string());
            }
            return Ok(Liveness::Command(cmd.to_string()));
        }
        if let Some(rest) = spec.strip_prefix("http://") {
            let (address, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            if !address.contains(':') {
                return Err(format!("liveness address needs a port: {spec}"));
            }
            return Ok(Liveness::Http {
                address: address.to_string(),
                path: path.to_string(),
            });
        }
        Err(format!("unsupported liveness probe: {spec}"))
    }
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve an environment by name; `None` picks the only one defined.
    pub fn environment(&self, name: Option<&str>) -> Result<Environment, ConfigError> {
        let (name, raw) = match name {
            Some(name) => self
                .environments
                .get_key_value(name)
                .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))?,
            None => {
                let mut iter = self.environments.iter();
                match (iter.next(), iter.next()) {
                    (None, _) => return Err(ConfigError::NoEnvironments),
                    (Some(only), None) => only,
                    (Some(_), Some(_)) => {
                        let names: Vec<&str> =
                            self.environments.keys().map(String::as_str).collect();
                        return Err(ConfigError::AmbiguousEnvironment(names.join(", ")));
                    }
                }
            }
        };
        raw.resolve(name)
    }

    /// Scaffold a cutover.toml with a single environment.
    pub fn scaffold(env: &str, root: &str) -> Self {
        let mut environments = BTreeMap::new();
        environments.insert(
            env.to_string(),
            EnvironmentConfig {
                root: root.to_string(),
                keep: Some(DEFAULT_KEEP),
                fetch_retries: Some(DEFAULT_FETCH_RETRIES),
                steps: Some(StepsConfig {
                    fetch: None,
                    install: Some(vec!["composer install --no-dev --optimize-autoloader".to_string()]),
                    migrate: Some(vec![
                        "php bin/console doctrine:migrations:migrate --no-interaction".to_string(),
                    ]),
                    warm: Some(vec!["php bin/console cache:warmup".to_string()]),
                }),
                shared: Some(SharedConfig {
                    paths: Some(vec![".env.local".to_string(), "var/log".to_string()]),
                }),
                health: Some(HealthConfig {
                    pre_check: Some(vec!["php bin/console about".to_string()]),
                    pre_check_timeout: Some("30s".to_string()),
                    liveness: Some("http://127.0.0.1:8080/healthz".to_string()),
                    probe_timeout: Some("2s".to_string()),
                    interval: Some("1s".to_string()),
                    window: Some("30s".to_string()),
                    required_successes: Some(3),
                    maintenance: Some(true),
                }),
                supervisor: Some(SupervisorConfig {
                    reload: Some(vec!["sudo systemctl reload php-fpm".to_string()]),
                    timeout: Some("30s".to_string()),
                }),
                timeouts: Some(TimeoutsConfig {
                    transfer: Some("5m".to_string()),
                    step: Some("10m".to_string()),
                }),
            },
        );
        CutoverConfig { environments }
    }
}

impl EnvironmentConfig {
    /// Apply defaults and validate.
    pub fn resolve(&self, name: &str) -> Result<Environment, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            env: name.to_string(),
            reason,
        };

        let root = PathBuf::from(&self.root);
        if !root.is_absolute() {
            return Err(invalid(format!("root must be an absolute path: {}", self.root)));
        }

        let keep = self.keep.unwrap_or(DEFAULT_KEEP);
        if keep < 1 {
            return Err(invalid("keep must be at least 1".to_string()));
        }

        let steps = self.steps.clone().unwrap_or_default();
        let steps = Steps {
            fetch: steps.fetch.unwrap_or_default(),
            install: steps.install.unwrap_or_default(),
            migrate: steps.migrate.unwrap_or_default(),
            warm: steps.warm.unwrap_or_default(),
        };

        let shared_paths = self
            .shared
            .as_ref()
            .and_then(|s| s.paths.clone())
            .unwrap_or_default();
        for path in &shared_paths {
            if !is_plain_relative(path) {
                return Err(invalid(format!("shared path must be relative and stay inside the release: {path}")));
            }
        }

        let duration = |value: &Option<String>, default: Duration| -> Result<Duration, ConfigError> {
            match value {
                Some(s) => parse_duration(s).ok_or_else(|| invalid(format!("invalid duration: {s}"))),
                None => Ok(default),
            }
        };

        let defaults = GateSettings::default();
        let raw_health = self.health.clone().unwrap_or_default();
        let health = GateSettings {
            pre_check: raw_health.pre_check.unwrap_or_default(),
            pre_check_timeout: duration(&raw_health.pre_check_timeout, defaults.pre_check_timeout)?,
            liveness: match &raw_health.liveness {
                Some(spec) => Liveness::parse(spec).map_err(invalid)?,
                None => Liveness::None,
            },
            probe_timeout: duration(&raw_health.probe_timeout, defaults.probe_timeout)?,
            interval: duration(&raw_health.interval, defaults.interval)?,
            window: duration(&raw_health.window, defaults.window)?,
            required_successes: raw_health
                .required_successes
                .unwrap_or(defaults.required_successes),
            maintenance: raw_health.maintenance.unwrap_or(defaults.maintenance),
        };
        if health.required_successes < 1 {
            return Err(invalid("required_successes must be at least 1".to_string()));
        }

        let raw_supervisor = self.supervisor.clone().unwrap_or_default();
        let supervisor = SupervisorSettings {
            reload: raw_supervisor.reload.unwrap_or_default(),
            timeout: duration(&raw_supervisor.timeout, SupervisorSettings::default().timeout)?,
        };

        let timeouts = self.timeouts.clone().unwrap_or_default();

        Ok(Environment {
            name: name.to_string(),
            root,
            keep,
            fetch_retries: self.fetch_retries.unwrap_or(DEFAULT_FETCH_RETRIES),
            steps,
            shared_paths,
            health,
            supervisor,
            transfer_timeout: duration(&timeouts.transfer, Duration::from_secs(300))?,
            step_timeout: duration(&timeouts.step, Duration::from_secs(600))?,
        })
    }
}

impl Environment {
    /// Minimal environment rooted at `root`, with every step empty.
    pub fn new(name: &str, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            keep: DEFAULT_KEEP,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            steps: Steps::default(),
            shared_paths: Vec::new(),
            health: GateSettings::default(),
            supervisor: SupervisorSettings::default(),
            transfer_timeout: Duration::from_secs(300),
            step_timeout: Duration::from_secs(600),
        }
    }
}

fn is_plain_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
