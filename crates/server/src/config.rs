use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// HMAC key for auth tokens. Empty means a random per-process secret.
    #[serde(default)]
    pub nonce_secret: String,
    pub nonce_purpose: String,
    pub nonce_lifetime_seconds: u64,
    pub debug: bool,
    #[serde(default)]
    pub admin_key: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/server.db".into(),
            nonce_secret: String::new(),
            nonce_purpose: "ajax_router".into(),
            nonce_lifetime_seconds: 86_400,
            debug: false,
            admin_key: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = load_settings_from("server")?;

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }

    Ok(settings)
}

/// Defaults, then the optional config file `file`, then `APP__*` variables.
pub fn load_settings_from(file: &str) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let settings = Config::builder()
        .set_default("server_bind", defaults.server_bind)?
        .set_default("database_url", defaults.database_url)?
        .set_default("nonce_secret", defaults.nonce_secret)?
        .set_default("nonce_purpose", defaults.nonce_purpose)?
        .set_default(
            "nonce_lifetime_seconds",
            defaults.nonce_lifetime_seconds as i64,
        )?
        .set_default("debug", defaults.debug)?
        .set_default("max_body_bytes", defaults.max_body_bytes as i64)?
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to load server settings")?
        .try_deserialize::<Settings>()
        .context("invalid server settings")?;

    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
