use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// Configures a [`CryptoSession`][crate::CryptoSession].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Produce ASCII armored output.
    ///
    /// Defaults to `true`.
    pub armored: bool,
    /// The keyring directory.
    ///
    /// Defaults to the platform's temporary directory.
    pub keyring_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            armored: true,
            keyring_path: std::env::temp_dir(),
        }
    }
}

impl SessionConfig {
    const ARMORED: &'static str = "armored";
    const KEYRING_PATH: &'static str = "keyring_path";

    /// Creates an armored configuration for the keyring at
    /// `keyring_path`.
    pub fn new(keyring_path: impl Into<PathBuf>) -> Self {
        Self {
            keyring_path: keyring_path.into(),
            ..Self::default()
        }
    }

    /// Sets [`armored`][Self::armored].
    #[must_use]
    pub fn with_armored(mut self, armored: bool) -> Self {
        self.armored = armored;
        self
    }

    /// Sets [`keyring_path`][Self::keyring_path].
    #[must_use]
    pub fn with_keyring_path(mut self, keyring_path: impl Into<PathBuf>) -> Self {
        self.keyring_path = keyring_path.into();
        self
    }

    /// Returns the keyring directory.
    pub fn keyring_path(&self) -> &Path {
        &self.keyring_path
    }

    /// Builds a configuration from loosely typed host input.
    ///
    /// Unknown keys and known keys holding the wrong type are
    /// ignored. Anything other than an object yields the defaults.
    pub fn from_json(value: &Value) -> Self {
        let mut cfg = Self::default();
        let Some(map) = value.as_object() else {
            debug!("configuration is not an object, using defaults");
            return cfg;
        };
        for (key, value) in map {
            match (key.as_str(), value) {
                (Self::ARMORED, Value::Bool(armored)) => cfg.armored = *armored,
                (Self::KEYRING_PATH, Value::String(path)) => cfg.keyring_path = path.into(),
                (key, value) => debug!(key, %value, "ignoring configuration entry"),
            }
        }
        cfg
    }
}

impl<'de> Deserialize<'de> for SessionConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_json(&value))
    }
}
