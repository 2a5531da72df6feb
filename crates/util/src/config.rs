use std::{env, fmt, net::SocketAddr, time::Duration};

use super::{server_bind_address, split_list};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://hostmap.db?mode=rwc";
pub const PLATFORM_MODULE: &str = "hostmap";

const DEV_LOCKDOWN_SECRET: &str = "hostmap-dev-lockdown-secret";
const DEV_VERIFY_TOKEN: &str = "hostmap-dev-verify-token";
const DEV_ADMIN_TOKEN: &str = "hostmap-dev-admin-token";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// What the host framework reports about itself.
///
/// In a standalone deployment these values come from the environment; they
/// stand in for the framework's own setup and module-loading state.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub network_domain: String,
    pub main_site_id: i64,
    pub setup_finished: bool,
    pub loaded_modules: Vec<String>,
    pub extensions: Vec<String>,
}

/// Settings for domain mapping, verification and lockdown.
#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub alias_prefixes: Vec<String>,
    pub trust_forwarded_host: bool,
    pub lockdown_secret: String,
    pub verify_token: String,
    /// Bearer token guarding the admin and lifecycle routes.
    pub admin_token: String,
    pub bootstrap_timeout: Duration,
    pub probe_timeout: Duration,
    pub job_max_attempts: u32,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub host: HostSettings,
    pub domains: DomainSettings,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let host = HostSettings {
            network_domain: env::var("HOSTMAP_NETWORK_DOMAIN")
                .map(|value| value.trim().to_ascii_lowercase())
                .unwrap_or_else(|_| "localhost".to_string()),
            main_site_id: parse_number("HOSTMAP_MAIN_SITE_ID", 1)?,
            setup_finished: parse_bool("HOSTMAP_SETUP_FINISHED", true)?,
            loaded_modules: list_or_default("HOSTMAP_LOADED_MODULES", &[PLATFORM_MODULE]),
            extensions: list_or_default("HOSTMAP_EXTENSIONS", &[PLATFORM_MODULE]),
        };

        let domains = DomainSettings {
            alias_prefixes: list_or_default("HOSTMAP_ALIAS_PREFIXES", &["www."]),
            trust_forwarded_host: parse_bool("HOSTMAP_TRUST_FORWARDED_HOST", false)?,
            lockdown_secret: secret(
                "HOSTMAP_LOCKDOWN_SECRET",
                DEV_LOCKDOWN_SECRET,
                environment,
            )?,
            verify_token: secret("HOSTMAP_VERIFY_TOKEN", DEV_VERIFY_TOKEN, environment)?,
            admin_token: secret("HOSTMAP_ADMIN_TOKEN", DEV_ADMIN_TOKEN, environment)?,
            bootstrap_timeout: Duration::from_millis(parse_number(
                "HOSTMAP_BOOTSTRAP_TIMEOUT_MS",
                2000,
            )?),
            probe_timeout: Duration::from_secs(parse_number("HOSTMAP_PROBE_TIMEOUT_SECS", 10)?),
            job_max_attempts: parse_number("HOSTMAP_JOB_MAX_ATTEMPTS", 5)?,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            host,
            domains,
        })
    }
}

fn list_or_default(var: &'static str, default: &[&str]) -> Vec<String> {
    match env::var(var) {
        Ok(raw) => split_list(&raw),
        Err(_) => default.iter().map(|item| item.to_string()).collect(),
    }
}

fn parse_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Ok(raw) = env::var(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { var, value: raw }),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn secret(
    var: &'static str,
    dev_default: &str,
    environment: Environment,
) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ if environment == Environment::Production => Err(ConfigError::MissingSecret(var)),
        _ => Ok(dev_default.to_string()),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue { var: &'static str, value: String },
    MissingSecret(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { var, value } => write!(f, "invalid {var} value: {value}"),
            Self::MissingSecret(var) => write!(f, "{var} must be set in production"),
        }
    }
}

impl std::error::Error for ConfigError {}
