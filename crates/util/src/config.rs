use std::{env, fmt, net::SocketAddr, num::ParseIntError, time::Duration};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

const DEFAULT_DATABASE_URL: &str = "sqlite:idrelay.db?mode=rwc";
const DEFAULT_DOWNSTREAM_URL: &str = "http://127.0.0.1:9000/";
const DEFAULT_PROVIDER_URL: &str = "http://127.0.0.1:9100/";
const DEFAULT_DOWNSTREAM_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 5_000;

/// Loads environment variables from `.env` when available.
///
/// Deployed relays configure themselves through real environment variables,
/// so a missing dotenv file is not an error.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Resolves the listen address from `APP_BIND_ADDR`, falling back to
/// [`DEFAULT_BIND_ADDR`] when the variable is not set.
fn bind_address() -> Result<SocketAddr, ConfigError> {
    let value = env::var("APP_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    value.parse().map_err(ConfigError::BindAddress)
}

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

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Shared secret for webhook signature verification. `None` only when
    /// unsigned mode was requested explicitly.
    pub webhook_secret: Option<Vec<u8>>,
    pub downstream_url: String,
    pub downstream_timeout: Duration,
    pub provider_base_url: String,
    pub provider_app_token: String,
    pub provider_timeout: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    ///
    /// Fail-closed default: a production posture with no `WEBHOOK_SECRET` is
    /// a configuration error unless `WEBHOOK_ALLOW_UNSIGNED=1` asks for the
    /// unsafe mode out loud.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = bind_address()?;

        let webhook_secret = env::var("WEBHOOK_SECRET")
            .ok()
            .filter(|value| !value.is_empty())
            .map(String::into_bytes);
        let allow_unsigned = matches!(
            env::var("WEBHOOK_ALLOW_UNSIGNED").as_deref(),
            Ok("1") | Ok("true")
        );
        if webhook_secret.is_none() && environment == Environment::Production && !allow_unsigned {
            return Err(ConfigError::MissingWebhookSecret);
        }

        let downstream_timeout_ms =
            timeout_ms("DOWNSTREAM_TIMEOUT_MS", DEFAULT_DOWNSTREAM_TIMEOUT_MS)?;
        let provider_timeout_ms = timeout_ms("PROVIDER_TIMEOUT_MS", DEFAULT_PROVIDER_TIMEOUT_MS)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            webhook_secret,
            downstream_url: env::var("DOWNSTREAM_URL")
                .unwrap_or_else(|_| DEFAULT_DOWNSTREAM_URL.to_string()),
            downstream_timeout: Duration::from_millis(downstream_timeout_ms),
            provider_base_url: env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_PROVIDER_URL.to_string()),
            provider_app_token: env::var("PROVIDER_APP_TOKEN").unwrap_or_default(),
            provider_timeout: Duration::from_millis(provider_timeout_ms),
        })
    }
}

fn timeout_ms(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| ConfigError::InvalidTimeout(key, err)),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingWebhookSecret,
    InvalidTimeout(&'static str, ParseIntError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingWebhookSecret => write!(
                f,
                "WEBHOOK_SECRET is required in production; set WEBHOOK_ALLOW_UNSIGNED=1 \
                 to run the explicit unsigned mode"
            ),
            Self::InvalidTimeout(key, err) => write!(f, "invalid {key} value: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_env() {
        for key in [
            "APP_ENV",
            "APP_BIND_ADDR",
            "DATABASE_URL",
            "WEBHOOK_SECRET",
            "WEBHOOK_ALLOW_UNSIGNED",
            "DOWNSTREAM_URL",
            "DOWNSTREAM_TIMEOUT_MS",
            "PROVIDER_BASE_URL",
            "PROVIDER_APP_TOKEN",
            "PROVIDER_TIMEOUT_MS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.webhook_secret, None);
        assert_eq!(config.downstream_timeout, Duration::from_millis(3_000));
        assert_eq!(config.provider_timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn custom_bind_address_is_read() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");

        clear_env();
    }

    #[test]
    fn production_without_secret_is_refused() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("missing secret must error");
        assert!(matches!(err, ConfigError::MissingWebhookSecret));

        clear_env();
    }

    #[test]
    fn production_unsigned_mode_must_be_explicit() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("WEBHOOK_ALLOW_UNSIGNED", "1");

        let config = AppConfig::from_env().expect("explicit unsigned mode loads");
        assert_eq!(config.webhook_secret, None);

        clear_env();
    }

    #[test]
    fn secret_and_timeouts_are_read() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("WEBHOOK_SECRET", "top-secret");
        env::set_var("DOWNSTREAM_TIMEOUT_MS", "250");
        env::set_var("PROVIDER_TIMEOUT_MS", "750");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.webhook_secret.as_deref(), Some(&b"top-secret"[..]));
        assert_eq!(config.downstream_timeout, Duration::from_millis(250));
        assert_eq!(config.provider_timeout, Duration::from_millis(750));

        clear_env();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }
}
