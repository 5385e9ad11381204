use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use chrono::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub enrollment: EnrollmentConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            enrollment: EnrollmentConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Business dials for the enrollment workflow, payments, and background sweeps.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentConfig {
    /// Flat enrollment fee. Every pending enrollment is created with exactly this amount due.
    pub fee: u32,
    pub currency: String,
    pub accepted_providers: Vec<String>,
    pub payment_expiry_hours: u32,
    pub receipt_stale_days: u32,
    pub ocr_acceptance_threshold: f32,
    /// OCR calls allowed in flight at once.
    pub ocr_max_concurrency: usize,
    /// Zero keeps re-prompting forever.
    pub max_step_retries: u8,
    pub session_idle_ttl_hours: u32,
    pub sweep_interval_secs: u64,
    pub treasurers: Vec<String>,
    pub legacy_csv_path: Option<PathBuf>,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            fee: 10_000,
            currency: "FCFA".to_string(),
            accepted_providers: vec!["OM".to_string(), "MV".to_string(), "WV".to_string()],
            payment_expiry_hours: 24,
            receipt_stale_days: 30,
            ocr_acceptance_threshold: 0.70,
            ocr_max_concurrency: 4,
            max_step_retries: 3,
            session_idle_ttl_hours: 72,
            sweep_interval_secs: 300,
            treasurers: vec!["tresorier-1".to_string()],
            legacy_csv_path: None,
        }
    }
}

impl EnrollmentConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let fee = parse_var("ENROLLMENT_FEE", defaults.fee)?;
        if fee == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "ENROLLMENT_FEE",
            });
        }

        let ocr_acceptance_threshold =
            parse_var("OCR_ACCEPTANCE_THRESHOLD", defaults.ocr_acceptance_threshold)?;
        if !(ocr_acceptance_threshold > 0.0 && ocr_acceptance_threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold);
        }

        let ocr_max_concurrency = parse_var("OCR_MAX_CONCURRENCY", defaults.ocr_max_concurrency)?;
        if ocr_max_concurrency == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "OCR_MAX_CONCURRENCY",
            });
        }

        Ok(Self {
            fee,
            currency: env::var("ENROLLMENT_CURRENCY").unwrap_or(defaults.currency),
            accepted_providers: list_var("PAYMENT_PROVIDERS")
                .map(|codes| codes.into_iter().map(|code| code.to_ascii_uppercase()).collect())
                .unwrap_or(defaults.accepted_providers),
            payment_expiry_hours: parse_var("PAYMENT_EXPIRY_HOURS", defaults.payment_expiry_hours)?,
            receipt_stale_days: parse_var("RECEIPT_STALE_DAYS", defaults.receipt_stale_days)?,
            ocr_acceptance_threshold,
            ocr_max_concurrency,
            max_step_retries: parse_var("WORKFLOW_MAX_STEP_RETRIES", defaults.max_step_retries)?,
            session_idle_ttl_hours: parse_var(
                "SESSION_IDLE_TTL_HOURS",
                defaults.session_idle_ttl_hours,
            )?,
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            treasurers: list_var("TREASURER_IDS").unwrap_or(defaults.treasurers),
            legacy_csv_path: env::var("LEGACY_CSV_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn payment_expiry(&self) -> Duration {
        Duration::hours(i64::from(self.payment_expiry_hours))
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::hours(i64::from(self.session_idle_ttl_hours))
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key }),
        _ => Ok(default),
    }
}

fn list_var(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let values: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str },
    InvalidThreshold,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key } => {
                write!(f, "{key} must be a valid positive number")
            }
            ConfigError::InvalidThreshold => {
                write!(f, "OCR_ACCEPTANCE_THRESHOLD must be within (0, 1]")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidThreshold => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "ENROLLMENT_FEE",
            "ENROLLMENT_CURRENCY",
            "PAYMENT_PROVIDERS",
            "PAYMENT_EXPIRY_HOURS",
            "RECEIPT_STALE_DAYS",
            "OCR_ACCEPTANCE_THRESHOLD",
            "OCR_MAX_CONCURRENCY",
            "WORKFLOW_MAX_STEP_RETRIES",
            "SESSION_IDLE_TTL_HOURS",
            "SWEEP_INTERVAL_SECS",
            "TREASURER_IDS",
            "LEGACY_CSV_PATH",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.enrollment, EnrollmentConfig::default());
        assert_eq!(config.enrollment.payment_expiry(), Duration::hours(24));
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn reads_enrollment_overrides() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ENROLLMENT_FEE", "15000");
        env::set_var("PAYMENT_PROVIDERS", "om, wv");
        env::set_var("TREASURER_IDS", "alice,bob");
        env::set_var("WORKFLOW_MAX_STEP_RETRIES", "0");
        env::set_var("OCR_MAX_CONCURRENCY", "2");
        let config = AppConfig::load().expect("config loads");
        assert_eq!(config.enrollment.ocr_max_concurrency, 2);
        assert_eq!(config.enrollment.fee, 15_000);
        assert_eq!(config.enrollment.accepted_providers, vec!["OM", "WV"]);
        assert_eq!(config.enrollment.treasurers, vec!["alice", "bob"]);
        assert_eq!(config.enrollment.max_step_retries, 0);
        reset_env();
    }

    #[test]
    fn rejects_zero_fee_and_bad_threshold() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ENROLLMENT_FEE", "0");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidNumber {
                key: "ENROLLMENT_FEE"
            })
        ));
        reset_env();
        env::set_var("OCR_ACCEPTANCE_THRESHOLD", "1.5");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidThreshold)
        ));
        reset_env();
    }
}
