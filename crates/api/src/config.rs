//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Payment rails
    pub card_gateway_url: String,
    pub card_gateway_api_key: String,
    pub card_webhook_secret: String,
    pub momo_gateway_url: String,
    pub momo_gateway_api_key: String,
    pub momo_webhook_secret: String,

    // Notification dispatcher (optional; absent disables dispatch)
    pub notify_base_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            card_gateway_url: env::var("CARD_GATEWAY_URL")
                .map_err(|_| ConfigError::Missing("CARD_GATEWAY_URL"))?,
            card_gateway_api_key: env::var("CARD_GATEWAY_API_KEY")
                .map_err(|_| ConfigError::Missing("CARD_GATEWAY_API_KEY"))?,
            card_webhook_secret: env::var("CARD_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("CARD_WEBHOOK_SECRET"))?,
            momo_gateway_url: env::var("MOMO_GATEWAY_URL")
                .map_err(|_| ConfigError::Missing("MOMO_GATEWAY_URL"))?,
            momo_gateway_api_key: env::var("MOMO_GATEWAY_API_KEY")
                .map_err(|_| ConfigError::Missing("MOMO_GATEWAY_API_KEY"))?,
            momo_webhook_secret: env::var("MOMO_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("MOMO_WEBHOOK_SECRET"))?,

            notify_base_url: env::var("NOTIFY_BASE_URL").ok(),
        })
    }

    /// Webhook signing secret for a given rail
    pub fn webhook_secret(&self, gateway: rebill_shared::GatewayKind) -> &str {
        match gateway {
            rebill_shared::GatewayKind::Card => &self.card_webhook_secret,
            rebill_shared::GatewayKind::MobileMoney => &self.momo_webhook_secret,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
