//! Config schema. One file, three accepted formats (TOML, YAML, JSON).

use {
    secrecy::Secret,
    serde::Deserialize,
    thiserror::Error,
};

use trellis_protocol::Address;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (and no setup file to fall back to)")]
    NotFound,

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Key authorizing the setup protocol.
    pub api_key: String,
    /// Bootstrap state: only `setup` actions are honored while set.
    pub setup_mode: bool,
    /// The server's own fully-specified address. Its domain defines the
    /// tenancy; every admitted client must share it.
    pub address: Address,
    pub listen: ListenConfig,
    pub tls: TlsConfig,
    pub store: StoreConfig,
    pub telegram: TelegramConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            setup_mode: false,
            address: Address::default(),
            listen: ListenConfig::default(),
            tls: TlsConfig::default(),
            store: StoreConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl HubConfig {
    /// Startup validation. Failures here are fatal (the process refuses to
    /// start); nothing else in the hub re-checks these.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.address.is_fully_specified() {
            return Err(ConfigError::Invalid(format!(
                "server address `{}` must be fully specified (no wildcards)",
                self.address
            )));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::Invalid("api_key must not be empty".into()));
        }
        if self.listen.port == 0 {
            return Err(ConfigError::Invalid("listen.port must not be 0".into()));
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "tls.cert_path and tls.key_path are required when tls.enabled".into(),
            ));
        }
        self.telegram.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8443,
        }
    }
}

/// TLS termination config. Carried for the listener; the core itself never
/// touches certificates.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite connection URL.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://trellis.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Secret<String>,
    pub chat_id: i64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: Secret::new(String::new()),
            chat_id: 0,
        }
    }
}

impl Clone for TelegramConfig {
    fn clone(&self) -> Self {
        use secrecy::ExposeSecret;
        Self {
            enabled: self.enabled,
            bot_token: Secret::new(self.bot_token.expose_secret().clone()),
            chat_id: self.chat_id,
        }
    }
}

impl TelegramConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        use secrecy::ExposeSecret;
        if self.enabled {
            if self.bot_token.expose_secret().is_empty() {
                return Err(ConfigError::Invalid(
                    "telegram.bot_token is required when telegram.enabled".into(),
                ));
            }
            if self.chat_id == 0 {
                return Err(ConfigError::Invalid(
                    "telegram.chat_id is required when telegram.enabled".into(),
                ));
            }
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> HubConfig {
        let mut cfg = HubConfig::default();
        cfg.api_key = "hub-master-key".into();
        cfg.address = Address::parse("demo.server.hub.main.1").unwrap();
        cfg
    }

    #[test]
    fn defaults_fail_validation() {
        assert!(HubConfig::default().validate().is_err());
    }

    #[test]
    fn fully_specified_config_validates() {
        valid().validate().unwrap();
    }

    #[test]
    fn wildcard_server_address_is_rejected() {
        let mut cfg = valid();
        cfg.address = Address::parse("demo.server.hub").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn telegram_enabled_requires_token_and_chat() {
        let mut cfg = valid();
        cfg.telegram.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.telegram.bot_token = Secret::new("123:abc".into());
        assert!(cfg.validate().is_err());
        cfg.telegram.chat_id = 42;
        cfg.validate().unwrap();
    }
}
