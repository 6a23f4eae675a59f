//! Interfaces to an OpenPGP engine.
//!
//! An [`Engine`] performs the process-wide bootstrap steps and hands
//! out [`Context`]s. A [`Context`] runs the individual operations and
//! hands out [`Key`] and [`Data`] handles. Every handle type owns an
//! engine resource and must release it when dropped.
//!
//! [`CryptoSession`][crate::CryptoSession] sequences these calls;
//! implementations only translate them to the engine.

use std::{
    ffi::CStr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{bootstrap::Latch, error::EngineError, key::KeyRecord};

/// An OpenPGP engine.
pub trait Engine {
    /// An owned engine context.
    type Context: Context;

    /// Returns the latch guarding this engine's bootstrap.
    fn latch(&self) -> &Latch;

    /// Runs the engine's version check and reports whether the
    /// engine accepted it.
    ///
    /// This is the first call made into the engine.
    fn check_version(&self) -> bool;

    /// Hands the character classification locale to the engine.
    fn set_locale(&self, ctype: &CStr) -> Result<(), EngineError>;

    /// Checks that the engine supports OpenPGP.
    fn check_protocol(&self) -> Result<(), EngineError>;

    /// Returns a copy of the engine's OpenPGP settings.
    fn engine_info(&self) -> Result<EngineInfo, EngineError>;

    /// Allocates a new, unconfigured context.
    fn new_context(&self) -> Result<Self::Context, EngineError>;
}

/// An owned engine context.
///
/// Dropping it releases the context.
pub trait Context: Send {
    /// An owned key handle.
    type Key: Key;
    /// An owned data object.
    type Data: Data;

    /// Binds the context to OpenPGP.
    fn set_protocol(&mut self) -> Result<(), EngineError>;

    /// Sets the engine executable and the keyring directory.
    fn set_engine_info(&mut self, file_name: &Path, home_dir: &Path) -> Result<(), EngineError>;

    /// Enables or disables ASCII armor.
    fn set_armor(&mut self, armored: bool);

    /// Wraps a copy of `bytes` as engine data.
    fn data_from_bytes(&mut self, bytes: &[u8]) -> Result<Self::Data, EngineError>;

    /// Allocates an empty data object.
    fn data_new(&mut self) -> Result<Self::Data, EngineError>;

    /// Imports the keys in `data`.
    fn import(&mut self, data: &mut Self::Data) -> Result<ImportStatus, EngineError>;

    /// Starts listing every key, public and secret.
    fn keylist_start(&mut self) -> Result<(), EngineError>;

    /// Returns the next key, or `None` at end-of-stream.
    fn keylist_next(&mut self) -> Result<Option<Self::Key>, EngineError>;

    /// Ends the current key listing.
    fn keylist_end(&mut self) -> Result<(), EngineError>;

    /// Looks up a key by fingerprint, or `None` if it does not
    /// exist.
    fn get_key(&mut self, fingerprint: &str) -> Result<Option<Self::Key>, EngineError>;

    /// Encrypts `plain` into `cipher` for `recipients`, trusting
    /// every recipient.
    fn encrypt(
        &mut self,
        recipients: &[&Self::Key],
        plain: &mut Self::Data,
        cipher: &mut Self::Data,
    ) -> Result<EncryptStatus, EngineError>;
}

/// An owned key handle.
///
/// Dropping it releases the handle.
pub trait Key {
    /// Copies the key's metadata out of the engine.
    fn record(&self) -> KeyRecord;
}

/// An owned data object.
///
/// Dropping it releases the object.
pub trait Data {
    /// The engine-allocated contents.
    type Buffer: AsRef<[u8]> + Send;

    /// Releases the data object and returns its contents without
    /// copying them.
    fn into_buffer(self) -> Self::Buffer;
}

/// The engine's OpenPGP settings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    /// The engine version.
    pub version: String,
    /// The engine executable.
    pub file_name: PathBuf,
    /// The engine's default home directory, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<PathBuf>,
    /// The minimum engine version the library requires, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_version: Option<String>,
}

/// The engine's report of an import.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportStatus {
    /// The number of keys the engine looked at.
    pub considered: u32,
    /// The fingerprints of the imported entries, in order.
    pub fingerprints: Vec<String>,
}

/// The engine's report of an encryption.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EncryptStatus {
    /// Recipients the engine refused.
    pub invalid_recipients: Vec<InvalidKey>,
}

/// A recipient the engine refused.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidKey {
    /// The refused key's fingerprint.
    pub fingerprint: String,
    /// Why the engine refused it.
    pub reason: Option<EngineError>,
}
