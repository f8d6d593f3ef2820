//! Server settings read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use barvault_core::BarsConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DB_PATH: &str = "./db/bars.db";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: String,
    pub request_timeout: Duration,
    pub bars: BarsConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let bars = BarsConfig::from_env();

        let listen_addr = std::env::var("BARVAULT_LISTEN_ADDR")
            .ok()
            .and_then(|raw| {
                raw.parse()
                    .map_err(|_| tracing::warn!("Ignoring invalid BARVAULT_LISTEN_ADDR '{}'", raw))
                    .ok()
            })
            .unwrap_or_else(|| Self::default().listen_addr);
        let db_path =
            std::env::var("BARVAULT_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let timeout_ms = std::env::var("BARVAULT_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| {
                        tracing::warn!("Ignoring invalid BARVAULT_REQUEST_TIMEOUT_MS '{}'", raw)
                    })
                    .ok()
            })
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        Self {
            listen_addr,
            db_path,
            request_timeout: Duration::from_millis(timeout_ms),
            bars,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080))),
            db_path: DEFAULT_DB_PATH.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            bars: BarsConfig::default(),
        }
    }
}
