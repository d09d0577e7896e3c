use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

impl Config {
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|account| account.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub display_name: Option<String>,
}

impl AccountConfig {
    /// Human-readable label for account pickers; falls back to the JID.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.jid)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    pub default_service: Option<String>,
}

impl DiscoveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            default_service: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    log_level: Option<String>,
    request_timeout_ms: Option<String>,
    default_service: Option<String>,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"# Accounts are normally provided by the host application.
# [[accounts]]
# id = "work"
# jid = "alice@example.org"
# password = ""
# display_name = "Work"

[discovery]
request_timeout_ms = 5000
join_timeout_ms = 10000
# default_service = "conference.example.org"

[logging]
level = "info"

[event_bus]
channel_capacity = 1024
"#;

/// Return the resolved platform-appropriate configuration file path.
#[cfg(feature = "native")]
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "waddle", "waddle-rooms") {
        proj_dirs.config_dir().join("rooms.toml")
    } else {
        PathBuf::from("rooms.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides.
#[cfg(feature = "native")]
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. A missing file is created with
/// defaults and the defaults are returned.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        log_level: std::env::var("WADDLE_LOG_LEVEL").ok(),
        request_timeout_ms: std::env::var("WADDLE_REQUEST_TIMEOUT_MS").ok(),
        default_service: std::env::var("WADDLE_DEFAULT_SERVICE").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    if let Some(raw) = overrides.request_timeout_ms {
        config.discovery.request_timeout_ms =
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "discovery.request_timeout_ms".to_string(),
                    message: format!("'{raw}' is not a number of milliseconds"),
                })?;
    }
    if let Some(service) = overrides.default_service {
        config.discovery.default_service = Some(service);
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();
    for (index, account) in config.accounts.iter().enumerate() {
        if account.id.trim().is_empty() {
            missing.push(format!("accounts[{index}].id"));
        }
        if account.jid.trim().is_empty() {
            missing.push(format!("accounts[{index}].jid"));
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    let mut seen = HashSet::new();
    for account in &config.accounts {
        if !seen.insert(account.id.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "accounts.id".to_string(),
                message: format!("duplicate account id '{}'", account.id),
            });
        }
        if !account.jid.contains('@') || account.jid.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "accounts.jid".to_string(),
                message: format!("'{}' is not a bare account JID", account.jid),
            });
        }
    }

    if config.discovery.request_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "discovery.request_timeout_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    if config.discovery.join_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "discovery.join_timeout_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
