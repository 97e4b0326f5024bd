use serde::Deserialize;
use std::env::vars;
use std::fmt::Display;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Env {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "prod")]
    Prod,
    #[serde(rename = "test")]
    Test,
}

impl Display for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Env::Local => write!(f, "local"),
            Env::Prod => write!(f, "prod"),
            Env::Test => write!(f, "test"),
        }
    }
}

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

// The final, validated configuration struct.
#[derive(Debug, Clone)]
pub struct Config {
    env: Env,
    database_url: String,
    server_addr: String,
    port: u16,
    database_max_connections: u32,
    request_timeout: Duration,
    // Only carried for the auth layer in front of the services.
    jwt_secret: String,
}

// An intermediate struct for deserializing environment variables
// where most fields are optional.
#[derive(Deserialize)]
struct RawConfig {
    env: Env,
    database_url: String,
    server_addr: Option<String>,
    port: Option<u16>,
    database_max_connections: Option<u32>,
    request_timeout_ms: Option<u64>,
    jwt_secret: Option<String>,
}

impl Config {
    /// Create a test configuration with default values.
    ///
    /// This function is available for both unit tests and integration tests.
    /// It should not be used in production code.
    pub fn new_for_test() -> Self {
        Self {
            env: Env::Test,
            database_url: "postgres://localhost:5432/conduit_test".to_owned(),
            server_addr: "127.0.0.1".to_owned(),
            port: 8080,
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            jwt_secret: "test-jwt-secret-key-for-local-development".to_owned(),
        }
    }

    /// Like [`Config::new_for_test`], but for the `local` environment.
    pub fn new_for_local() -> Self {
        Self {
            env: Env::Local,
            ..Self::new_for_test()
        }
    }

    /// Test configuration with a custom request timeout.
    pub fn new_for_test_with_timeout(timeout: Duration) -> Self {
        Self {
            request_timeout: timeout,
            ..Self::new_for_test()
        }
    }

    pub fn environment(&self) -> &Env {
        &self.env
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database_max_connections(&self) -> u32 {
        self.database_max_connections
    }

    /// Default deadline applied to each service call.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_local(&self) -> bool {
        matches!(self.env, Env::Local)
    }

    pub fn is_prod(&self) -> bool {
        matches!(self.env, Env::Prod)
    }

    /// Get the JWT secret used by the auth layer.
    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }

    /// Initializes configuration by reading from environment variables
    /// and applying environment-aware defaults.
    pub fn init() -> anyhow::Result<Self> {
        info!("Loading configuration from environment variables");

        let raw_config: RawConfig = serde_env::from_iter(vars())?;
        Self::from_raw(raw_config)
    }

    fn from_raw(raw_config: RawConfig) -> anyhow::Result<Self> {
        let RawConfig {
            env,
            database_url,
            server_addr,
            port,
            database_max_connections,
            request_timeout_ms,
            jwt_secret,
        } = raw_config;

        let server_addr = match server_addr {
            Some(addr) => {
                info!("Using provided SERVER_ADDR: {}", addr);
                addr
            }
            None => {
                let default_addr = match env {
                    Env::Local => "127.0.0.1",
                    _ => "0.0.0.0",
                };
                info!(
                    "SERVER_ADDR not set, defaulting to {} for {} environment",
                    default_addr, env
                );
                default_addr.to_owned()
            }
        };

        let port = match port {
            Some(port) => port,
            None if matches!(env, Env::Local) => {
                info!("PORT not set, defaulting to 8080 for local environment");
                8080
            }
            None => anyhow::bail!("PORT must be set for {} environment", env),
        };

        let jwt_secret = match jwt_secret {
            Some(secret) => secret,
            None if matches!(env, Env::Local | Env::Test) => {
                info!("JWT_SECRET not set, using default for {} environment", env);
                "default-jwt-secret-for-local-development-only".to_owned()
            }
            None => anyhow::bail!("JWT_SECRET must be set for {} environment", env),
        };

        let database_max_connections = match database_max_connections {
            Some(0) => anyhow::bail!("DATABASE_MAX_CONNECTIONS must be greater than 0"),
            Some(n) => n,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let request_timeout = match request_timeout_ms {
            Some(0) => anyhow::bail!("REQUEST_TIMEOUT_MS must be greater than 0"),
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        };

        Ok(Config {
            env,
            database_url,
            server_addr,
            port,
            database_max_connections,
            request_timeout,
            jwt_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_env::from_iter;

    #[test]
    fn local_defaults_apply() {
        let raw: RawConfig = from_iter(vec![
            ("ENV", "local"),
            ("DATABASE_URL", "postgres://example"),
        ])
        .expect("RawConfig should deserialize");

        let config = Config::from_raw(raw).expect("local config should build");
        assert_eq!(config.server_addr(), "127.0.0.1");
        assert_eq!(config.port(), 8080);
        assert_eq!(config.database_max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.request_timeout(), Duration::from_millis(5000));
        assert!(config.is_local());
    }

    #[test]
    fn prod_requires_port() {
        let raw: RawConfig = from_iter(vec![
            ("ENV", "prod"),
            ("DATABASE_URL", "postgres://example"),
            ("JWT_SECRET", "secret"),
        ])
        .expect("RawConfig should deserialize");

        let result = Config::from_raw(raw);
        assert!(result.unwrap_err().to_string().contains("PORT"));
    }

    #[test]
    fn prod_requires_jwt_secret() {
        let raw: RawConfig = from_iter(vec![
            ("ENV", "prod"),
            ("DATABASE_URL", "postgres://example"),
            ("PORT", "8080"),
        ])
        .expect("RawConfig should deserialize");

        let result = Config::from_raw(raw);
        assert!(result.unwrap_err().to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn prod_binds_publicly_and_reads_tuning() {
        let raw: RawConfig = from_iter(vec![
            ("ENV", "prod"),
            ("DATABASE_URL", "postgres://example"),
            ("PORT", "9000"),
            ("JWT_SECRET", "secret"),
            ("DATABASE_MAX_CONNECTIONS", "32"),
            ("REQUEST_TIMEOUT_MS", "250"),
        ])
        .expect("RawConfig should deserialize");

        let config = Config::from_raw(raw).expect("prod config should build");
        assert_eq!(config.server_addr(), "0.0.0.0");
        assert_eq!(config.port(), 9000);
        assert_eq!(config.database_max_connections(), 32);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert!(config.is_prod());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let raw: RawConfig = from_iter(vec![
            ("ENV", "test"),
            ("DATABASE_URL", "postgres://example"),
            ("PORT", "8080"),
            ("REQUEST_TIMEOUT_MS", "0"),
        ])
        .expect("RawConfig should deserialize");

        let result = Config::from_raw(raw);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("REQUEST_TIMEOUT_MS")
        );
    }
}
