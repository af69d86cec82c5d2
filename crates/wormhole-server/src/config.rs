use std::path::PathBuf;

use thiserror::Error;

/// Which services this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Rendezvous and transit together (default).
    Both,
    /// Rendezvous (mailbox) server only.
    Rendezvous,
    /// Transit (piping) server only.
    Transit,
    /// Run one cleaning pass against the database and exit.
    Clean,
}

impl ServeMode {
    pub fn runs_rendezvous(self) -> bool {
        matches!(self, ServeMode::Both | ServeMode::Rendezvous)
    }

    pub fn runs_transit(self) -> bool {
        matches!(self, ServeMode::Both | ServeMode::Transit)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: ServeMode,

    pub relay_host: String,
    pub relay_port: u16,

    pub transit_host: String,
    pub transit_port: u16,

    /// Path to the SQLite database file.
    pub db_file: PathBuf,

    /// Whether clients may request the list of nameplates in use.
    pub allow_list: bool,

    /// Client version advertised in the welcome (empty = not advertised).
    pub advertised_version: String,

    /// Message of the day shown to connecting clients (empty = none).
    pub welcome_motd: String,

    /// If non-empty, sent to every client on connect; peers disconnect.
    pub welcome_error: String,

    /// Minutes between cleaning passes.
    pub cleaning_interval_minutes: u64,

    /// Minutes a channel may idle before cleaning removes it. Must exceed
    /// the cleaning interval.
    pub channel_expiration_minutes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServeMode::Both,
            relay_host: "0.0.0.0".to_string(),
            relay_port: 4000,
            transit_host: "0.0.0.0".to_string(),
            transit_port: 4001,
            db_file: PathBuf::from("./wormhole-relay.db"),
            allow_list: true,
            advertised_version: String::new(),
            welcome_motd: String::new(),
            welcome_error: String::new(),
            cleaning_interval_minutes: 5,
            channel_expiration_minutes: 11,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cleaning interval should be less than channel expiration")]
    Cleaning,

    #[error("database file path must not be empty")]
    DbFile,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("WORMHOLE_MODE") {
            match mode.to_ascii_uppercase().as_str() {
                "BOTH" => config.mode = ServeMode::Both,
                "RELAY" | "RENDEZVOUS" => config.mode = ServeMode::Rendezvous,
                "TRANSIT" => config.mode = ServeMode::Transit,
                "CLEAN" => config.mode = ServeMode::Clean,
                other => {
                    tracing::warn!(value = %other, "Invalid WORMHOLE_MODE, using default");
                }
            }
        }

        if let Ok(host) = std::env::var("RELAY_HOST") {
            config.relay_host = host;
        }

        if let Ok(port) = std::env::var("RELAY_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.relay_port = parsed;
            } else {
                tracing::warn!(value = %port, "Invalid RELAY_PORT, using default");
            }
        }

        if let Ok(host) = std::env::var("TRANSIT_HOST") {
            config.transit_host = host;
        }

        if let Ok(port) = std::env::var("TRANSIT_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.transit_port = parsed;
            } else {
                tracing::warn!(value = %port, "Invalid TRANSIT_PORT, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_FILE") {
            config.db_file = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("ALLOW_LIST") {
            config.allow_list = val != "false" && val != "0";
        }

        if let Ok(version) = std::env::var("ADVERTISED_VERSION") {
            config.advertised_version = version;
        }

        if let Ok(motd) = std::env::var("WELCOME_MOTD") {
            config.welcome_motd = motd;
        }

        if let Ok(error) = std::env::var("WELCOME_ERROR") {
            config.welcome_error = error;
        }

        if let Ok(val) = std::env::var("CLEANING_INTERVAL_MINUTES") {
            if let Ok(n) = val.parse::<u64>() {
                config.cleaning_interval_minutes = n;
            } else {
                tracing::warn!(value = %val, "Invalid CLEANING_INTERVAL_MINUTES, using default");
            }
        }

        if let Ok(val) = std::env::var("CHANNEL_EXPIRATION_MINUTES") {
            if let Ok(n) = val.parse::<u64>() {
                config.channel_expiration_minutes = n;
            } else {
                tracing::warn!(value = %val, "Invalid CHANNEL_EXPIRATION_MINUTES, using default");
            }
        }

        config
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.cleaning_interval_minutes >= self.channel_expiration_minutes {
            return Err(ConfigError::Cleaning);
        }

        if self.db_file.as_os_str().is_empty() {
            return Err(ConfigError::DbFile);
        }

        Ok(())
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    pub fn transit_addr(&self) -> String {
        format!("{}:{}", self.transit_host, self.transit_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.mode, ServeMode::Both);
        assert_eq!(config.relay_addr(), "0.0.0.0:4000");
        assert_eq!(config.transit_addr(), "0.0.0.0:4001");
        assert!(config.allow_list);
        assert!(config.verify().is_ok());
    }

    #[test]
    fn test_cleaning_must_be_under_expiration() {
        let mut config = ServerConfig::default();
        config.cleaning_interval_minutes = 11;
        config.channel_expiration_minutes = 11;
        assert_eq!(config.verify(), Err(ConfigError::Cleaning));

        config.cleaning_interval_minutes = 5;
        assert!(config.verify().is_ok());
    }

    #[test]
    fn test_empty_db_path_is_rejected() {
        let mut config = ServerConfig::default();
        config.db_file = PathBuf::new();
        assert_eq!(config.verify(), Err(ConfigError::DbFile));
    }

    #[test]
    fn test_modes() {
        assert!(ServeMode::Both.runs_rendezvous());
        assert!(ServeMode::Both.runs_transit());
        assert!(!ServeMode::Rendezvous.runs_transit());
        assert!(!ServeMode::Transit.runs_rendezvous());
        assert!(!ServeMode::Clean.runs_rendezvous());
        assert!(!ServeMode::Clean.runs_transit());
    }
}
