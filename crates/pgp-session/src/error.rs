use std::{borrow::Cow, fmt, io, path::PathBuf};

use buggy::Bug;

/// A status code reported by the OpenPGP engine.
///
/// This is the typed form of the engine's raw integer status.
/// It never holds the "no error" code.
#[derive(Clone, Eq, PartialEq)]
pub struct EngineError {
    code: u32,
    description: Cow<'static, str>,
}

impl EngineError {
    /// The engine's "end of file" code.
    pub const EOF: u32 = 16383;
    /// The engine's "invalid value" code.
    pub const INV_VALUE: u32 = 55;
    /// The engine's "internal bug" code.
    pub const BUG: u32 = 59;

    /// Creates an `EngineError` from an engine code and the
    /// engine's description of it.
    pub fn new(code: u32, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Returns the underlying code.
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// Returns the engine's description of the code.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Reports whether this is the end-of-stream marker.
    pub const fn is_eof(&self) -> bool {
        self.code == Self::EOF
    }
}

impl std::error::Error for EngineError {}

impl From<Bug> for EngineError {
    fn from(bug: Bug) -> Self {
        Self::new(Self::BUG, bug.msg())
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineError")
            .field("code", &self.code)
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description, self.code)
    }
}

/// An error returned while bootstrapping the engine.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The process locale could not be set or handed to the
    /// engine.
    #[error("unable to propagate the locale to the engine")]
    LocaleUnavailable(#[source] Option<EngineError>),
    /// The engine rejected the version check.
    #[error("engine version check failed")]
    VersionCheckFailed,
    /// The engine does not support OpenPGP on this platform.
    #[error("OpenPGP is not supported on this platform")]
    UnsupportedProtocol(#[source] EngineError),
}

/// An error returned by [`CryptoSession`][crate::CryptoSession]
/// construction.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Engine bootstrap failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// The engine could not report its OpenPGP executable.
    #[error("cannot get the engine information")]
    EngineInfoUnavailable(#[source] EngineError),
    /// The engine could not allocate a context.
    #[error("cannot create an engine context")]
    ContextCreationFailed(#[source] EngineError),
    /// The context could not be bound to OpenPGP.
    #[error("cannot set the context protocol to OpenPGP")]
    ProtocolBindingFailed(#[source] EngineError),
    /// The context could not be configured for the keyring.
    #[error("cannot configure the engine for keyring `{}`", path.display())]
    EngineConfigFailed {
        /// The keyring path from the configuration.
        path: PathBuf,
        /// Why configuration failed.
        #[source]
        source: ConfigError,
    },
}

/// Why [`SessionError::EngineConfigFailed`] happened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The keyring directory could not be created or inspected.
    #[error("keyring directory is unusable")]
    Keyring(#[from] io::Error),
    /// The keyring path exists but is not a directory.
    #[error("keyring path is not a directory")]
    NotADirectory,
    /// The keyring directory is read-only.
    #[error("keyring directory is read-only")]
    ReadOnly,
    /// The engine rejected the settings.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// An error returned by
/// [`CryptoSession::import_key`][crate::CryptoSession::import_key].
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The engine failed to import the material.
    #[error("engine failed to import key material")]
    EngineFailure(#[source] EngineError),
}

/// An error returned by
/// [`CryptoSession::list_keys`][crate::CryptoSession::list_keys].
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    /// The key listing ended with something other than
    /// end-of-stream.
    #[error("engine failed to list keys")]
    EngineFailure(#[source] EngineError),
}

/// An error returned by
/// [`CryptoSession::encrypt`][crate::CryptoSession::encrypt].
#[derive(Debug, thiserror::Error)]
pub enum EncryptError {
    /// No key matches the fingerprint.
    #[error("unknown recipient `{0}`")]
    UnknownRecipient(String),
    /// The engine failed.
    #[error("engine failed to encrypt")]
    EngineFailure(#[source] EngineError),
    /// The engine finished but refused the recipient.
    #[error("invalid recipient `{fingerprint}`")]
    InvalidRecipient {
        /// The rejected key, as reported by the engine.
        fingerprint: String,
        /// The engine's reason, if it gave one.
        #[source]
        reason: Option<EngineError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let errs = [
            EngineError::new(0, ""),
            EngineError::new(EngineError::EOF, "End of file"),
            EngineError::new(u32::MAX, "Unknown error code"),
        ];
        for (i, err) in errs.into_iter().enumerate() {
            let got = err.to_string();
            assert!(got.contains(&err.code().to_string()), "#{i}: {got}");
        }
    }

    #[test]
    fn test_is_eof() {
        assert!(EngineError::new(EngineError::EOF, "End of file").is_eof());
        assert!(!EngineError::new(1, "General error").is_eof());
    }

    #[test]
    fn test_session_error_source_chain() {
        let err = SessionError::EngineConfigFailed {
            path: PathBuf::from("/nope"),
            source: ConfigError::NotADirectory,
        };
        assert!(err.to_string().contains("/nope"));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("keyring path is not a directory"));
    }
}
