//! Configuration types.
//!
//! Built once at startup and handed to the listener, sender and dispatcher
//! constructors. Nothing reads the environment after that.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default listener poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default capacity of the fetched-mail queue.
pub const DEFAULT_MAIL_QUEUE_CAPACITY: usize = 20;
/// Capacity of the listener error queue.
pub const ERROR_QUEUE_CAPACITY: usize = 1;
/// Default cap on concurrently running request tasks.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// IMAP connection settings for the mailbox listener.
#[derive(Debug)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// SMTP connection settings for the outbound sender.
#[derive(Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Address replies are sent from.
    pub from_address: String,
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of request tasks running at once.
    pub max_in_flight: usize,
    /// Upper bound on a single handler call.
    pub handler_timeout: Duration,
    /// Upper bound on a single reply send.
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            handler_timeout: Duration::from_secs(300), // 5 minutes
            send_timeout: Duration::from_secs(60),
        }
    }
}

/// Gateway configuration.
#[derive(Debug)]
pub struct GatewayConfig {
    /// Application name, used as reply subject prefix and sender display name.
    pub app_name: String,
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    pub poll_interval: Duration,
    pub mail_queue_capacity: usize,
    pub dispatch: DispatchConfig,
    /// JSON file listing the known users.
    pub users_file: PathBuf,
}

impl GatewayConfig {
    /// Build config from `GATEWAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let app_name = lookup("GATEWAY_APP_NAME").unwrap_or_else(|| "mail-gateway".to_string());

        let imap_host = required("GATEWAY_IMAP_HOST")?;
        let imap_port = parse_or(&lookup, "GATEWAY_IMAP_PORT", 993)?;
        let imap_username = required("GATEWAY_IMAP_USERNAME")?;
        let imap_password = required("GATEWAY_IMAP_PASSWORD")?;

        let smtp_host =
            lookup("GATEWAY_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port = parse_or(&lookup, "GATEWAY_SMTP_PORT", 465)?;
        let smtp_username = lookup("GATEWAY_SMTP_USERNAME").unwrap_or_else(|| imap_username.clone());
        let smtp_password = lookup("GATEWAY_SMTP_PASSWORD").unwrap_or_else(|| imap_password.clone());
        let from_address = lookup("GATEWAY_FROM_ADDRESS").unwrap_or_else(|| smtp_username.clone());

        let poll_interval = Duration::from_secs(parse_or(
            &lookup,
            "GATEWAY_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL.as_secs(),
        )?);
        let mail_queue_capacity = parse_or(
            &lookup,
            "GATEWAY_MAIL_QUEUE_CAPACITY",
            DEFAULT_MAIL_QUEUE_CAPACITY,
        )?;

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            max_in_flight: parse_or(&lookup, "GATEWAY_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            handler_timeout: Duration::from_secs(parse_or(
                &lookup,
                "GATEWAY_HANDLER_TIMEOUT_SECS",
                defaults.handler_timeout.as_secs(),
            )?),
            send_timeout: Duration::from_secs(parse_or(
                &lookup,
                "GATEWAY_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
        };

        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if mail_queue_capacity == 0 || dispatch.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                key: if mail_queue_capacity == 0 {
                    "GATEWAY_MAIL_QUEUE_CAPACITY".into()
                } else {
                    "GATEWAY_MAX_IN_FLIGHT".into()
                },
                message: "must be greater than zero".into(),
            });
        }

        let users_file = lookup("GATEWAY_USERS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./users.json"));

        Ok(Self {
            app_name,
            imap: ImapConfig {
                host: imap_host,
                port: imap_port,
                username: imap_username,
                password: SecretString::from(imap_password),
            },
            smtp: SmtpConfig {
                host: smtp_host,
                port: smtp_port,
                username: smtp_username,
                password: SecretString::from(smtp_password),
                from_address,
            },
            poll_interval,
            mail_queue_capacity,
            dispatch,
            users_file,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
