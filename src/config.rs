use crate::ratelimit::{RateLimitPolicy, RouteClass};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Minimum HS256 secret length in bytes.
pub const MIN_JWT_SECRET_LEN: usize = 32;

const DEFAULT_ISSUER: &str = "linkhub";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_COOKIE_NAME: &str = "linkhub_session";

#[derive(Clone)]
pub struct Config {
    // Token signing
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub bcrypt_cost: u32,

    // Redis
    pub redis_url: String,
    pub store_timeout_ms: u64,

    // Server
    pub bind_addr: SocketAddr,

    // Sessions and caches (in seconds)
    pub session_ttl_secs: u64,
    pub identity_cache_ttl_secs: u64,
    pub verification_ttl_secs: u64,
    pub session_cookie_name: String,
    pub cookie_secure: bool,

    // Rate limiting
    pub rate_limit_global_max: u64,
    pub rate_limit_global_window_secs: u64,
    pub rate_limit_auth_max: u64,
    pub rate_limit_auth_window_secs: u64,
    pub rate_limit_api_max: u64,
    pub rate_limit_api_window_secs: u64,

    // Proxy
    pub trusted_proxy_count: usize,

    // Promoted to admin at boot if the account exists
    pub admin_username: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .field("redis_url", &"[REDACTED]")
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("bind_addr", &self.bind_addr)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("identity_cache_ttl_secs", &self.identity_cache_ttl_secs)
            .field("verification_ttl_secs", &self.verification_ttl_secs)
            .field("session_cookie_name", &self.session_cookie_name)
            .field("cookie_secure", &self.cookie_secure)
            .field("rate_limit_global_max", &self.rate_limit_global_max)
            .field(
                "rate_limit_global_window_secs",
                &self.rate_limit_global_window_secs,
            )
            .field("rate_limit_auth_max", &self.rate_limit_auth_max)
            .field(
                "rate_limit_auth_window_secs",
                &self.rate_limit_auth_window_secs,
            )
            .field("rate_limit_api_max", &self.rate_limit_api_max)
            .field("rate_limit_api_window_secs", &self.rate_limit_api_window_secs)
            .field("trusted_proxy_count", &self.trusted_proxy_count)
            .field("admin_username", &self.admin_username)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),
}

impl Config {
    /// Configuration with every optional setting at its default.
    pub fn with_defaults(jwt_secret: impl Into<String>, redis_url: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            jwt_issuer: DEFAULT_ISSUER.to_string(),
            bcrypt_cost: crate::auth::credentials::PASSWORD_HASH_COST,
            redis_url: redis_url.into(),
            store_timeout_ms: 500,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            session_ttl_secs: 86_400,
            identity_cache_ttl_secs: 1_800,
            verification_ttl_secs: 86_400,
            session_cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_secure: true,
            rate_limit_global_max: 300,
            rate_limit_global_window_secs: 60,
            rate_limit_auth_max: 5,
            rate_limit_auth_window_secs: 900,
            rate_limit_api_max: 120,
            rate_limit_api_window_secs: 60,
            trusted_proxy_count: 0,
            admin_username: None,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Attempt to load .env file, but don't fail if it doesn't exist
        // (env vars may be set directly in production)
        let _ = dotenvy::dotenv();
        Self::from_process_env()
    }

    /// Load configuration from the process environment only, skipping `.env`.
    pub fn from_process_env() -> Result<Self, ConfigError> {
        // Signing secret is required; the process must not start without it
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| ConfigError::MissingVar("JWT_SECRET".to_string()))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::InvalidValue(
                "JWT_SECRET".to_string(),
                format!("must be at least {} bytes", MIN_JWT_SECRET_LEN),
            ));
        }

        // Store URL has no default; sessions and counters live there
        let redis_url =
            env::var("REDIS_URL").map_err(|_| ConfigError::MissingVar("REDIS_URL".to_string()))?;

        let defaults = Self::with_defaults(jwt_secret, redis_url);

        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| DEFAULT_ISSUER.to_string());
        if jwt_issuer.is_empty() {
            return Err(ConfigError::InvalidValue(
                "JWT_ISSUER".to_string(),
                "cannot be empty".to_string(),
            ));
        }

        let bcrypt_cost = parse_env_or_default("BCRYPT_COST", defaults.bcrypt_cost)?;
        if !(4..=31).contains(&bcrypt_cost) {
            return Err(ConfigError::InvalidValue(
                "BCRYPT_COST".to_string(),
                "must be between 4 and 31".to_string(),
            ));
        }

        // Server
        let bind_addr_str =
            env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::ParseError("BIND_ADDR".to_string(), e.to_string()))?;

        let store_timeout_ms =
            parse_positive("STORE_TIMEOUT_MS", defaults.store_timeout_ms)?;

        // TTLs
        let session_ttl_secs = parse_positive("SESSION_TTL_SECS", defaults.session_ttl_secs)?;
        let identity_cache_ttl_secs =
            parse_positive("IDENTITY_CACHE_TTL_SECS", defaults.identity_cache_ttl_secs)?;
        let verification_ttl_secs =
            parse_positive("VERIFICATION_TTL_SECS", defaults.verification_ttl_secs)?;

        // Cookie
        let session_cookie_name =
            env::var("SESSION_COOKIE_NAME").unwrap_or_else(|_| DEFAULT_COOKIE_NAME.to_string());
        if session_cookie_name.is_empty()
            || !session_cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidValue(
                "SESSION_COOKIE_NAME".to_string(),
                "may only contain alphanumeric characters, hyphens, and underscores".to_string(),
            ));
        }
        let cookie_secure = parse_env_or_default("COOKIE_SECURE", defaults.cookie_secure)?;

        // Rate limiting
        let rate_limit_global_max =
            parse_positive("RATE_LIMIT_GLOBAL_MAX", defaults.rate_limit_global_max)?;
        let rate_limit_global_window_secs = parse_positive(
            "RATE_LIMIT_GLOBAL_WINDOW_SECS",
            defaults.rate_limit_global_window_secs,
        )?;
        let rate_limit_auth_max =
            parse_positive("RATE_LIMIT_AUTH_MAX", defaults.rate_limit_auth_max)?;
        let rate_limit_auth_window_secs = parse_positive(
            "RATE_LIMIT_AUTH_WINDOW_SECS",
            defaults.rate_limit_auth_window_secs,
        )?;
        let rate_limit_api_max = parse_positive("RATE_LIMIT_API_MAX", defaults.rate_limit_api_max)?;
        let rate_limit_api_window_secs = parse_positive(
            "RATE_LIMIT_API_WINDOW_SECS",
            defaults.rate_limit_api_window_secs,
        )?;

        // Proxy configuration
        let trusted_proxy_count =
            parse_env_or_default("TRUSTED_PROXY_COUNT", defaults.trusted_proxy_count)?;

        let admin_username = match env::var("ADMIN_USERNAME") {
            Ok(name) if !name.is_empty() => {
                crate::auth::validate::validate_username(&name).map_err(|e| {
                    ConfigError::InvalidValue("ADMIN_USERNAME".to_string(), e.to_string())
                })?;
                Some(name)
            }
            _ => None,
        };

        Ok(Config {
            jwt_issuer,
            bcrypt_cost,
            store_timeout_ms,
            bind_addr,
            session_ttl_secs,
            identity_cache_ttl_secs,
            verification_ttl_secs,
            session_cookie_name,
            cookie_secure,
            rate_limit_global_max,
            rate_limit_global_window_secs,
            rate_limit_auth_max,
            rate_limit_auth_window_secs,
            rate_limit_api_max,
            rate_limit_api_window_secs,
            trusted_proxy_count,
            admin_username,
            ..defaults
        })
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }

    pub fn verification_ttl(&self) -> Duration {
        Duration::from_secs(self.verification_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn rate_limit_policy(&self, class: RouteClass) -> RateLimitPolicy {
        let (limit, window_secs) = match class {
            RouteClass::Global => (
                self.rate_limit_global_max,
                self.rate_limit_global_window_secs,
            ),
            RouteClass::Auth => (self.rate_limit_auth_max, self.rate_limit_auth_window_secs),
            RouteClass::Api => (self.rate_limit_api_max, self.rate_limit_api_window_secs),
        };
        RateLimitPolicy {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// Helper function to parse environment variable with a default value
fn parse_env_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| ConfigError::ParseError(key.to_string(), format!("{}: {}", e, val))),
        Err(_) => Ok(default),
    }
}

/// Like [`parse_env_or_default`], rejecting zero.
fn parse_positive(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_env_or_default(key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}
