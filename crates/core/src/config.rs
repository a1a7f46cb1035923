use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub backends: BackendsConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BackendsConfig {
    pub primary: BackendConfig,
    pub analyst: BackendConfig,
    pub critic: BackendConfig,
}

/// One upstream model endpoint. A missing `api_key` marks the backend unavailable.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub stream_timeout_secs: u64,
}

impl BackendConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_ref().map(|key| !key.expose_secret().trim().is_empty()).unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_tool_rounds: u32,
    pub max_calls_per_round: u32,
    pub history_turns: u32,
    pub synthetic_chunk_chars: usize,
    pub synthetic_chunk_delay_ms: u64,
    pub identity_cache_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub primary_api_key: Option<String>,
    pub analyst_api_key: Option<String>,
    pub critic_api_key: Option<String>,
    pub max_tool_rounds: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://pulse.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            backends: BackendsConfig {
                primary: backend_defaults("https://api.openai.com/v1", "gpt-4o"),
                analyst: backend_defaults("https://api.deepseek.com", "deepseek-chat"),
                critic: backend_defaults("https://api.x.ai/v1", "grok-3"),
            },
            agent: AgentConfig {
                max_tool_rounds: 5,
                max_calls_per_round: 8,
                history_turns: 12,
                synthetic_chunk_chars: 24,
                synthetic_chunk_delay_ms: 15,
                identity_cache_ttl_secs: 60,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn backend_defaults(base_url: &str, model: &str) -> BackendConfig {
    BackendConfig {
        api_key: None,
        base_url: base_url.to_string(),
        model: model.to_string(),
        timeout_secs: 60,
        stream_timeout_secs: 180,
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pulse.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(backends) = patch.backends {
            if let Some(primary) = backends.primary {
                primary.apply_to(&mut self.backends.primary);
            }
            if let Some(analyst) = backends.analyst {
                analyst.apply_to(&mut self.backends.analyst);
            }
            if let Some(critic) = backends.critic {
                critic.apply_to(&mut self.backends.critic);
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_tool_rounds) = agent.max_tool_rounds {
                self.agent.max_tool_rounds = max_tool_rounds;
            }
            if let Some(max_calls_per_round) = agent.max_calls_per_round {
                self.agent.max_calls_per_round = max_calls_per_round;
            }
            if let Some(history_turns) = agent.history_turns {
                self.agent.history_turns = history_turns;
            }
            if let Some(synthetic_chunk_chars) = agent.synthetic_chunk_chars {
                self.agent.synthetic_chunk_chars = synthetic_chunk_chars;
            }
            if let Some(synthetic_chunk_delay_ms) = agent.synthetic_chunk_delay_ms {
                self.agent.synthetic_chunk_delay_ms = synthetic_chunk_delay_ms;
            }
            if let Some(identity_cache_ttl_secs) = agent.identity_cache_ttl_secs {
                self.agent.identity_cache_ttl_secs = identity_cache_ttl_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PULSE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PULSE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PULSE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PULSE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PULSE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PULSE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PULSE_SERVER_PORT") {
            self.server.port = parse_u16("PULSE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PULSE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PULSE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        apply_backend_env("PULSE_OPENAI", &mut self.backends.primary)?;
        apply_backend_env("PULSE_DEEPSEEK", &mut self.backends.analyst)?;
        apply_backend_env("PULSE_XAI", &mut self.backends.critic)?;

        if let Some(value) = read_env("PULSE_AGENT_MAX_TOOL_ROUNDS") {
            self.agent.max_tool_rounds = parse_u32("PULSE_AGENT_MAX_TOOL_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("PULSE_AGENT_MAX_CALLS_PER_ROUND") {
            self.agent.max_calls_per_round = parse_u32("PULSE_AGENT_MAX_CALLS_PER_ROUND", &value)?;
        }
        if let Some(value) = read_env("PULSE_AGENT_HISTORY_TURNS") {
            self.agent.history_turns = parse_u32("PULSE_AGENT_HISTORY_TURNS", &value)?;
        }
        if let Some(value) = read_env("PULSE_AGENT_SYNTHETIC_CHUNK_CHARS") {
            self.agent.synthetic_chunk_chars =
                parse_u32("PULSE_AGENT_SYNTHETIC_CHUNK_CHARS", &value)? as usize;
        }
        if let Some(value) = read_env("PULSE_AGENT_SYNTHETIC_CHUNK_DELAY_MS") {
            self.agent.synthetic_chunk_delay_ms =
                parse_u64("PULSE_AGENT_SYNTHETIC_CHUNK_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("PULSE_AGENT_IDENTITY_CACHE_TTL_SECS") {
            self.agent.identity_cache_ttl_secs =
                parse_u64("PULSE_AGENT_IDENTITY_CACHE_TTL_SECS", &value)?;
        }

        let log_level = read_env("PULSE_LOGGING_LEVEL").or_else(|| read_env("PULSE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("PULSE_LOGGING_FORMAT").or_else(|| read_env("PULSE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(key) = overrides.primary_api_key {
            self.backends.primary.api_key = Some(secret_value(key));
        }
        if let Some(key) = overrides.analyst_api_key {
            self.backends.analyst.api_key = Some(secret_value(key));
        }
        if let Some(key) = overrides.critic_api_key {
            self.backends.critic.api_key = Some(secret_value(key));
        }
        if let Some(max_tool_rounds) = overrides.max_tool_rounds {
            self.agent.max_tool_rounds = max_tool_rounds;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_backend("backends.primary", &self.backends.primary)?;
        validate_backend("backends.analyst", &self.backends.analyst)?;
        validate_backend("backends.critic", &self.backends.critic)?;
        validate_agent(&self.agent)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn apply_backend_env(prefix: &str, backend: &mut BackendConfig) -> Result<(), ConfigError> {
    if let Some(value) = read_env(&format!("{prefix}_API_KEY")) {
        backend.api_key = Some(secret_value(value));
    }
    if let Some(value) = read_env(&format!("{prefix}_BASE_URL")) {
        backend.base_url = value;
    }
    if let Some(value) = read_env(&format!("{prefix}_MODEL")) {
        backend.model = value;
    }
    let timeout_key = format!("{prefix}_TIMEOUT_SECS");
    if let Some(value) = read_env(&timeout_key) {
        backend.timeout_secs = parse_u64(&timeout_key, &value)?;
    }
    let stream_timeout_key = format!("{prefix}_STREAM_TIMEOUT_SECS");
    if let Some(value) = read_env(&stream_timeout_key) {
        backend.stream_timeout_secs = parse_u64(&stream_timeout_key, &value)?;
    }
    Ok(())
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pulse.toml"), PathBuf::from("config/pulse.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_backend(section: &str, backend: &BackendConfig) -> Result<(), ConfigError> {
    let base_url = backend.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{section}.base_url must start with http:// or https://"
        )));
    }

    if backend.model.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{section}.model must not be empty")));
    }

    if backend.timeout_secs == 0 || backend.timeout_secs > 300 {
        return Err(ConfigError::Validation(format!(
            "{section}.timeout_secs must be in range 1..=300"
        )));
    }

    if backend.stream_timeout_secs < backend.timeout_secs || backend.stream_timeout_secs > 900 {
        return Err(ConfigError::Validation(format!(
            "{section}.stream_timeout_secs must be in range timeout_secs..=900"
        )));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_tool_rounds == 0 || agent.max_tool_rounds > 20 {
        return Err(ConfigError::Validation(
            "agent.max_tool_rounds must be in range 1..=20".to_string(),
        ));
    }

    if agent.max_calls_per_round == 0 {
        return Err(ConfigError::Validation(
            "agent.max_calls_per_round must be greater than zero".to_string(),
        ));
    }

    if agent.synthetic_chunk_chars == 0 {
        return Err(ConfigError::Validation(
            "agent.synthetic_chunk_chars must be greater than zero".to_string(),
        ));
    }

    if agent.synthetic_chunk_delay_ms > 1_000 {
        return Err(ConfigError::Validation(
            "agent.synthetic_chunk_delay_ms must be at most 1000".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    backends: Option<BackendsPatch>,
    agent: Option<AgentPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendsPatch {
    primary: Option<BackendPatch>,
    analyst: Option<BackendPatch>,
    critic: Option<BackendPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    stream_timeout_secs: Option<u64>,
}

impl BackendPatch {
    fn apply_to(self, backend: &mut BackendConfig) {
        if let Some(api_key_value) = self.api_key {
            backend.api_key = Some(secret_value(api_key_value));
        }
        if let Some(base_url) = self.base_url {
            backend.base_url = base_url;
        }
        if let Some(model) = self.model {
            backend.model = model;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            backend.timeout_secs = timeout_secs;
        }
        if let Some(stream_timeout_secs) = self.stream_timeout_secs {
            backend.stream_timeout_secs = stream_timeout_secs;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_tool_rounds: Option<u32>,
    max_calls_per_round: Option<u32>,
    history_turns: Option<u32>,
    synthetic_chunk_chars: Option<usize>,
    synthetic_chunk_delay_ms: Option<u64>,
    identity_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PULSE_OPENAI_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("pulse.toml");
            fs::write(
                &path,
                r#"
[backends.primary]
api_key = "${TEST_PULSE_OPENAI_KEY}"
model = "gpt-4o-mini"

[agent]
max_tool_rounds = 3
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let key = config.backends.primary.api_key.as_ref().map(|key| key.expose_secret());
            ensure(key == Some("sk-from-env"), "primary key should be loaded from environment")?;
            ensure(config.backends.primary.model == "gpt-4o-mini", "model should come from file")?;
            ensure(config.agent.max_tool_rounds == 3, "round budget should come from file")?;
            ensure(!config.backends.analyst.is_configured(), "analyst has no credential")?;
            Ok(())
        })();

        clear_vars(&["TEST_PULSE_OPENAI_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PULSE_LOG_LEVEL", "warn");
        env::set_var("PULSE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["PULSE_LOG_LEVEL", "PULSE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PULSE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("PULSE_DEEPSEEK_API_KEY", "ds-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("pulse.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[backends.analyst]
api_key = "ds-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            let key = config.backends.analyst.api_key.as_ref().map(|key| key.expose_secret());
            ensure(key == Some("ds-from-env"), "env key should win over file and defaults")?;
            Ok(())
        })();

        clear_vars(&["PULSE_DATABASE_URL", "PULSE_DEEPSEEK_API_KEY"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PULSE_AGENT_MAX_TOOL_ROUNDS", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("agent.max_tool_rounds")
            );
            ensure(has_message, "validation failure should mention agent.max_tool_rounds")
        })();

        clear_vars(&["PULSE_AGENT_MAX_TOOL_ROUNDS"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PULSE_XAI_TIMEOUT_SECS", "soon");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected env override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "PULSE_XAI_TIMEOUT_SECS"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["PULSE_XAI_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PULSE_OPENAI_API_KEY", "sk-secret-value");
        env::set_var("PULSE_XAI_API_KEY", "xai-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain key")?;
            ensure(!debug.contains("xai-secret-value"), "debug output should not contain key")?;
            ensure(config.backends.primary.is_configured(), "primary should be configured")?;
            ensure(config.backends.critic.is_configured(), "critic should be configured")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["PULSE_OPENAI_API_KEY", "PULSE_XAI_API_KEY"]);
        result
    }
}
