//! Configuration loaded from environment variables.
//!
//! Read once at startup and immutable afterwards. Queue name defaults depend
//! on the language the process serves, so loading takes the language up front.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::language::Language;

/// Top-level configuration for a runner process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Language served by this process.
    pub language: Language,

    /// Run mode. Only debug mode may execute code as the worker's own user.
    pub mode: Mode,

    /// Broker connection and queue names.
    pub mq: MqConfig,

    /// Sandbox runtime settings.
    pub runtime: RuntimeConfig,

    /// RPC client settings.
    pub client: ClientConfig,
}

/// Run mode of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Debug,
    Release,
}

impl Mode {
    fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("debug") {
            Self::Debug
        } else {
            Self::Release
        }
    }

    /// Log level used when neither `RUST_LOG` nor `--log-level` is given.
    pub const fn default_log_level(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "info",
        }
    }
}

/// Message broker settings.
#[derive(Debug, Clone)]
pub struct MqConfig {
    /// Broker `host:port`.
    pub addr: String,
    pub user: String,
    pub password: String,
    /// Queue execution requests arrive on.
    pub recv_queue: String,
    /// Queue responses are published to.
    pub resp_queue: String,
}

impl MqConfig {
    /// AMQP connection URI.
    pub fn url(&self) -> String {
        format!("amqp://{}:{}@{}", self.user, self.password, self.addr)
    }
}

/// Sandbox runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Account to execute code as. `None` means the worker's own user.
    pub run_as: Option<String>,

    /// Password for `run_as`. Unsupported; only kept to warn about it.
    pub run_as_password: Option<String>,

    /// Workspace directory, wiped before every execution.
    pub dir: PathBuf,

    /// Wall-clock ceiling for one submitted program.
    pub exec_timeout: Duration,
}

/// RPC client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on one round trip, regardless of the caller's deadline.
    pub timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env(language: Language) -> Result<Self, ConfigError> {
        Self::from_vars(language, |key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(
        language: Language,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let (recv_default, resp_default) = language.default_queues();

        let config = Self {
            language,
            mode: Mode::parse(&var("MODE", "debug")),
            mq: MqConfig {
                addr: var("MQ_ADDR", "localhost:5672"),
                user: var("MQ_USER", "guest"),
                password: var("MQ_PASS", "guest"),
                recv_queue: var("MQ_RECVQ", recv_default),
                resp_queue: var("MQ_RESPQ", resp_default),
            },
            runtime: RuntimeConfig {
                run_as: lookup("RUNTIME_USERNAME").filter(|s| !s.is_empty()),
                run_as_password: lookup("RUNTIME_PASS").filter(|s| !s.is_empty()),
                dir: PathBuf::from(var("RUNTIME_DIR", "./runtimedir")),
                exec_timeout: seconds(
                    "RUNTIME_EXEC_TIMEOUT",
                    lookup("RUNTIME_EXEC_TIMEOUT"),
                    default_exec_timeout(),
                )?,
            },
            client: ClientConfig {
                timeout: seconds(
                    "CLIENT_TIMEOUT",
                    lookup("CLIENT_TIMEOUT"),
                    default_client_timeout(),
                )?,
            },
        };

        Ok(config)
    }

    /// Check cross-field rules that make the configuration unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.run_as.is_none() && self.mode != Mode::Debug {
            return Err(ConfigError::SameUserOutsideDebug);
        }
        if self.runtime.run_as_password.is_some() {
            warn!("RUNTIME_PASS is set but password authentication is not supported; ignoring it");
        }
        Ok(())
    }
}

fn seconds(
    var: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(Duration::from_secs(default));
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be greater than zero".into(),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

const fn default_exec_timeout() -> u64 {
    15
}

const fn default_client_timeout() -> u64 {
    20
}
