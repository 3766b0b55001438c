use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Distinguishes runtime behavior for different deployments of the service.
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
    pub pipeline: PipelineConfig,
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
            pipeline: PipelineConfig::from_env()?,
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

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Environment variable forced into every stage process.
///
/// The stages share one Python environment, so a numerical backend has to be
/// pinned uniformly or the first stage to import it decides for everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendToggle {
    pub key: String,
    pub value: String,
}

impl BackendToggle {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Keeps Hugging Face transformers on PyTorch.
    pub fn pytorch_only() -> Self {
        Self::new("TRANSFORMERS_NO_TF", "1")
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidBackendToggle(raw.to_string()))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidBackendToggle(raw.to_string()));
        }
        Ok(Self::new(key, value.trim()))
    }
}

/// Where stages live and how they are launched.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Holds the stage scripts plus any `.csv`/`.db` artifacts carried across runs.
    pub stage_dir: PathBuf,
    pub interpreter: String,
    pub backend_toggle: BackendToggle,
    pub stage_timeout: Option<Duration>,
    /// Receives a copy of every canonical artifact when set.
    pub output_dir: Option<PathBuf>,
    pub default_top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_dir: PathBuf::from("agents"),
            interpreter: "python3".to_string(),
            backend_toggle: BackendToggle::pytorch_only(),
            stage_timeout: None,
            output_dir: None,
            default_top_n: 10,
        }
    }
}

impl PipelineConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let stage_dir = env::var("HIRESENSE_STAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.stage_dir);
        let interpreter = env::var("HIRESENSE_INTERPRETER").unwrap_or(defaults.interpreter);
        let backend_toggle = match env::var("HIRESENSE_BACKEND_TOGGLE") {
            Ok(raw) => BackendToggle::parse(&raw)?,
            Err(_) => defaults.backend_toggle,
        };
        let stage_timeout = match env::var("HIRESENSE_STAGE_TIMEOUT_SECS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or(ConfigError::InvalidStageTimeout(raw))?;
                Some(Duration::from_secs(secs))
            }
            _ => None,
        };
        let output_dir = env::var("HIRESENSE_OUTPUT_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let default_top_n = match env::var("HIRESENSE_TOP_N") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidTopN(raw))?,
            Err(_) => defaults.default_top_n,
        };

        Ok(Self {
            stage_dir,
            interpreter,
            backend_toggle,
            stage_timeout,
            output_dir,
            default_top_n,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidBackendToggle(String),
    InvalidStageTimeout(String),
    InvalidTopN(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidBackendToggle(raw) => write!(
                f,
                "HIRESENSE_BACKEND_TOGGLE must look like KEY=VALUE (got '{}')",
                raw
            ),
            ConfigError::InvalidStageTimeout(raw) => write!(
                f,
                "HIRESENSE_STAGE_TIMEOUT_SECS must be a positive integer (got '{}')",
                raw
            ),
            ConfigError::InvalidTopN(raw) => {
                write!(f, "HIRESENSE_TOP_N must be a non-negative integer (got '{}')", raw)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidBackendToggle(_)
            | ConfigError::InvalidStageTimeout(_)
            | ConfigError::InvalidTopN(_) => None,
        }
    }
}
