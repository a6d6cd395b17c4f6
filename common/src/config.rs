// common/src/config.rs
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use config::{Config as ConfigFile, File, Environment};

/// Central configuration for both services
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub verify_server_addr: String,
    pub ws_url: String,
    pub bot_token: String,   // Platform bot credential, never sent to clients
    pub jwt_secret: String,

    // Wallet-link handshake tuning
    pub link: LinkConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Base reconnect delay in seconds
    pub reconnect_delay_secs: u64,
    /// Upper bound for reconnect backoff in seconds
    pub reconnect_max_delay_secs: u64,
    /// Challenge freshness window in seconds
    pub challenge_ttl_secs: u64,
    /// How long to wait for a single server response in seconds
    pub response_timeout_secs: u64,
    /// Outgoing ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Maximum accepted identity-assertion age in seconds (0 disables the check)
    pub auth_max_age_secs: i64,
    /// Issued JWT lifetime in seconds
    pub jwt_ttl_secs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verify_server_addr: "127.0.0.1:8081".to_string(),
            ws_url: "ws://127.0.0.1:8080/ws".to_string(),
            bot_token: String::new(),
            jwt_secret: "dev_secret".to_string(),

            link: LinkConfig {
                reconnect_delay_secs: 5,
                reconnect_max_delay_secs: 60,
                challenge_ttl_secs: 1200,
                response_timeout_secs: 30,
                heartbeat_interval_secs: 5,
                auth_max_age_secs: 86400,
                jwt_ttl_secs: 86400,
            },
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        // Get the run mode, defaulting to "development"
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        // Locate the config directory
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                // Check if we're in the project root or a subcrate
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        // Build configuration
        let config = ConfigFile::builder()
            // Start with defaults
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add environment specific config
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            // Add a local config file for local overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables with prefix "APP"
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Build and deserialize
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load from environment variables directly (backward compatibility)
    pub fn from_env() -> Self {
        // Try to load from file first
        match Self::load() {
            Ok(config) => {
                tracing::info!("Configuration loaded from files and environment");
                config
            },
            Err(e) => {
                tracing::warn!("Failed to load configuration from files: {}", e);
                tracing::info!("Falling back to environment variables only");

                let defaults = Config::default();

                let verify_server_addr = env::var("VERIFY_SERVER_ADDR")
                    .unwrap_or(defaults.verify_server_addr);

                let ws_url = env::var("WS_URL")
                    .unwrap_or(defaults.ws_url);

                let bot_token = env::var("BOT_TOKEN")
                    .unwrap_or(defaults.bot_token);

                let jwt_secret = env::var("JWT_SECRET")
                    .unwrap_or(defaults.jwt_secret);

                let reconnect_delay_secs = env::var("RECONNECT_DELAY_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(defaults.link.reconnect_delay_secs);

                let challenge_ttl_secs = env::var("CHALLENGE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(defaults.link.challenge_ttl_secs);

                Self {
                    verify_server_addr,
                    ws_url,
                    bot_token,
                    jwt_secret,
                    link: LinkConfig {
                        reconnect_delay_secs,
                        challenge_ttl_secs,
                        ..defaults.link
                    },
                }
            }
        }
    }
}
