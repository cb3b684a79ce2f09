use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 4310;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_SIGNAL_API_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_WA_BRIDGE_URL: &str = "http://127.0.0.1:3001";

/// Process configuration, read once from the environment at startup.
/// Invalid values are fatal; missing bridges merely start unavailable.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub signal_api_url: String,
    /// E.164 number of the linked Signal bridge account. Empty leaves the
    /// Signal adapter unavailable.
    pub signal_account: String,
    pub wa_bridge_url: String,
    /// Required `Origin` for hub subscribers; unset accepts any origin.
    pub client_origin: Option<String>,
    pub debug: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value '{raw}'"))?,
            Err(_) => DEFAULT_PORT,
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        Ok(Self {
            port,
            data_dir,
            signal_api_url: std::env::var("SIGNAL_API_URL")
                .unwrap_or_else(|_| DEFAULT_SIGNAL_API_URL.to_string()),
            signal_account: std::env::var("SIGNAL_ACCOUNT").unwrap_or_default(),
            wa_bridge_url: std::env::var("WA_BRIDGE_URL")
                .unwrap_or_else(|_| DEFAULT_WA_BRIDGE_URL.to_string()),
            client_origin: std::env::var("CLIENT_ORIGIN").ok().filter(|s| !s.is_empty()),
            debug: std::env::var("DEBUG")
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tracker.db")
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
