//! Validated server settings

use crate::catalog::{ResourceCatalog, PALETTE};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on board spots. With labels capped at
/// [`shared::MAX_DISPLAY_NAME_LEN`] bytes a full snapshot fits in one datagram.
pub const MAX_SPOTS: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("color slot count must be between 1 and {max}, got {got}")]
    Colors { got: usize, max: usize },
    #[error("board spot count must be between 1 and {max}, got {got}")]
    Spots { got: usize, max: usize },
    #[error("max clients must be at least 1")]
    MaxClients,
    #[error("board radius must be a positive number, got {0}")]
    BoardRadius(f32),
    #[error("client timeout must be non-zero")]
    ClientTimeout,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_clients: usize,
    pub colors: usize,
    pub spots: usize,
    pub board_radius: f32,
    /// Silence after which a participant is disconnected
    pub client_timeout: Duration,
    /// How often silent participants are looked for
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_clients: 8,
            colors: PALETTE.len(),
            spots: 12,
            board_radius: 220.0,
            client_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.colors == 0 || self.colors > PALETTE.len() {
            return Err(ConfigError::Colors {
                got: self.colors,
                max: PALETTE.len(),
            });
        }
        if self.spots == 0 || self.spots > MAX_SPOTS {
            return Err(ConfigError::Spots {
                got: self.spots,
                max: MAX_SPOTS,
            });
        }
        if self.max_clients == 0 {
            return Err(ConfigError::MaxClients);
        }
        if !(self.board_radius.is_finite() && self.board_radius > 0.0) {
            return Err(ConfigError::BoardRadius(self.board_radius));
        }
        if self.client_timeout.is_zero() {
            return Err(ConfigError::ClientTimeout);
        }
        Ok(())
    }

    pub fn catalogs(&self) -> Vec<ResourceCatalog> {
        vec![
            ResourceCatalog::colors(self.colors),
            ResourceCatalog::board_spots(self.spots, self.board_radius),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(ServerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_counts() {
        let config = ServerConfig {
            colors: 9,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Colors { got: 9, max: 8 })
        );

        let config = ServerConfig {
            spots: 0,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Spots { got: 0, max: 64 })
        );

        let config = ServerConfig {
            max_clients: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MaxClients));
    }

    #[test]
    fn test_rejects_bad_radius_and_timeout() {
        let config = ServerConfig {
            board_radius: -1.0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BoardRadius(-1.0)));

        let config = ServerConfig {
            client_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ClientTimeout));
    }

    #[test]
    fn test_catalogs_match_counts() {
        let config = ServerConfig {
            colors: 3,
            spots: 5,
            ..ServerConfig::default()
        };
        let catalogs = config.catalogs();
        assert_eq!(catalogs[0].len(), 3);
        assert_eq!(catalogs[1].len(), 5);
    }
}
