//! Backend connection configuration
//!
//! Built in code, the same way the TLS and HTTP/2 settings are; loading from
//! files is left to the embedding proxy.

use crate::error::Result;
use crate::h2::Settings;
use crate::tls::TlsConfig;
use std::time::Duration;

/// Settings shared by every backend connection of a proxy
#[derive(Debug, Clone)]
pub struct BackendConfig {
    tls: TlsConfig,
    h2_settings: Settings,
    connect_timeout: Duration,
    nodelay: bool,
    read_buffer_size: usize,
}

impl BackendConfig {
    pub fn builder() -> BackendConfigBuilder {
        BackendConfigBuilder::default()
    }

    /// Client TLS context for origins that need TLS
    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    /// Local SETTINGS announced on HTTP/2 backend connections
    pub fn h2_settings(&self) -> &Settings {
        &self.h2_settings
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }
}

/// Builder for [`BackendConfig`]
#[derive(Debug)]
pub struct BackendConfigBuilder {
    tls: Option<TlsConfig>,
    h2_settings: Settings,
    connect_timeout: Duration,
    nodelay: bool,
    read_buffer_size: usize,
}

impl Default for BackendConfigBuilder {
    fn default() -> Self {
        BackendConfigBuilder {
            tls: None,
            h2_settings: Settings::client_defaults(),
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            read_buffer_size: 16 * 1024,
        }
    }
}

impl BackendConfigBuilder {
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn h2_settings(mut self, settings: Settings) -> Self {
        self.h2_settings = settings;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Validates the HTTP/2 settings and builds the default TLS client
    /// context when none was given
    pub fn build(self) -> Result<BackendConfig> {
        self.h2_settings.validate()?;
        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsConfig::client().build()?,
        };

        Ok(BackendConfig {
            tls,
            h2_settings: self.h2_settings,
            connect_timeout: self.connect_timeout,
            nodelay: self.nodelay,
            read_buffer_size: self.read_buffer_size,
        })
    }
}
