//! SDK configuration loaded from a `contentpass_configuration.json` file.
//!
//! The configuration is immutable and loaded once at startup. It either
//! carries a single `base_url` serving both the API and the OIDC issuer, or a
//! separate `api_url` and `oidc_url` pair. `property_id` doubles as the OAuth
//! client id.

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file is not valid JSON or misses required fields.
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("configuration could not be read: {0}")]
    Io(#[from] std::io::Error),

    /// Neither `base_url` nor the `api_url`/`oidc_url` pair is present.
    #[error("configuration requires either base_url or both api_url and oidc_url")]
    MissingUrls,
}

/// Immutable SDK configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    schema_version: u32,
    #[serde(default)]
    base_url: Option<Url>,
    #[serde(default)]
    api_url: Option<Url>,
    #[serde(default)]
    oidc_url: Option<Url>,
    redirect_uri: Url,
    property_id: String,
}

impl Configuration {
    /// Parse a configuration from a JSON string.
    ///
    /// # Errors
    /// Returns [`ConfigError::Json`] on malformed JSON and
    /// [`ConfigError::MissingUrls`] when no usable URL combination is present.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a reader, typically the bundled
    /// `contentpass_configuration.json` file.
    ///
    /// # Errors
    /// Returns an error if reading fails or the content is invalid.
    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self, ConfigError> {
        let mut json = String::new();
        reader.read_to_string(&mut json)?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_none() && (self.api_url.is_none() || self.oidc_url.is_none()) {
            return Err(ConfigError::MissingUrls);
        }
        Ok(())
    }

    /// Configuration schema version.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Base URL of the contentpass API (metering, stats, one-time tokens).
    ///
    /// # Panics
    /// Never panics for configurations constructed through [`from_json`] or
    /// [`from_reader`], which validate URL presence.
    ///
    /// [`from_json`]: Configuration::from_json
    /// [`from_reader`]: Configuration::from_reader
    #[must_use]
    pub fn api_url(&self) -> &Url {
        self.api_url
            .as_ref()
            .or(self.base_url.as_ref())
            .unwrap_or_else(|| unreachable!("validated at construction"))
    }

    /// URL of the OIDC issuer used for service discovery.
    #[must_use]
    pub fn oidc_url(&self) -> &Url {
        self.oidc_url
            .as_ref()
            .or(self.base_url.as_ref())
            .unwrap_or_else(|| unreachable!("validated at construction"))
    }

    /// Redirect URI the authorization UI returns to.
    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Property id, which doubles as the OAuth client id.
    #[must_use]
    pub fn property_id(&self) -> &str {
        &self.property_id
    }
}
