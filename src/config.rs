use std::env::var;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use dotenv::dotenv;

/// How outgoing mail leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailTransport {
    /// Print the rendered mail to the log.
    Log,
    /// Store the mail in `mail_outbox` for an external relay.
    Outbox,
}

impl FromStr for MailTransport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(MailTransport::Log),
            "outbox" => Ok(MailTransport::Outbox),
            other => anyhow::bail!("Unknown MAIL_TRANSPORT `{}`", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
    pub media_root: PathBuf,
    pub mail_from: String,
    pub mail_transport: MailTransport,
    pub token_ttl_hours: i64,
    pub max_connections: u32,
}

impl Config {
    pub fn load() -> anyhow::Result<Config> {
        if let Err(err) = dotenv() {
            log::debug!("No .env file loaded: {}", err);
        }

        Ok(Config {
            database_url: var("DATABASE_URL").context("DATABASE_URL is not set")?,
            jwt_secret: var("JWT_SECRET").context("JWT_SECRET is not set")?,
            bind_addr: optional("BIND_ADDR", "127.0.0.1:3000")?,
            media_root: PathBuf::from(var("MEDIA_ROOT").unwrap_or_else(|_| "media".to_string())),
            mail_from: var("MAIL_FROM").unwrap_or_else(|_| "admin@parcplatform.com".to_string()),
            mail_transport: optional("MAIL_TRANSPORT", "log")?,
            token_ttl_hours: optional("TOKEN_TTL_HOURS", "12")?,
            max_connections: optional("DB_MAX_CONNECTIONS", "10")?,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Config {
        Config {
            database_url: "postgres://localhost/parc_test".to_string(),
            jwt_secret: "test-secret".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            media_root: std::env::temp_dir().join("parc-media-tests"),
            mail_from: "admin@parcplatform.com".to_string(),
            mail_transport: MailTransport::Log,
            token_ttl_hours: 12,
            max_connections: 1,
        }
    }
}

fn optional<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|err| anyhow::anyhow!("{} has invalid value `{}`: {}", key, raw, err))
}
