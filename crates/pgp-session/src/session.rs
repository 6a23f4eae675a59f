use std::{ffi::CString, fmt, fs, io, ops::Deref, path::Path};

use tracing::{debug, info, instrument, warn};

use crate::{
    config::SessionConfig,
    engine::{Context, Data, Engine, EngineInfo, Key},
    error::{ConfigError, EncryptError, EngineError, ImportError, ListError, SessionError},
    key::KeyRecord,
};

/// The ciphertext buffer type produced by `E`.
pub type Buffer<E> = <<<E as Engine>::Context as Context>::Data as Data>::Buffer;

/// A configured OpenPGP engine context bound to one keyring.
///
/// A session always holds a fully configured context. The context
/// is released when the session is dropped.
///
/// Operations take `&mut self`: a context must not be used by two
/// callers at once. Independent sessions, even for the same keyring,
/// can be used from different threads.
pub struct CryptoSession<E: Engine> {
    engine: E,
    config: SessionConfig,
    ctx: E::Context,
}

impl<E: Engine> CryptoSession<E> {
    /// Bootstraps `engine` if needed and creates a session for
    /// `config`.
    #[instrument(skip_all, fields(keyring = %config.keyring_path.display()))]
    pub fn with_engine(engine: E, config: SessionConfig) -> Result<Self, SessionError> {
        engine.latch().ensure(&engine)?;

        let info = engine
            .engine_info()
            .map_err(SessionError::EngineInfoUnavailable)?;
        debug!(version = %info.version, file_name = %info.file_name.display(), "engine info");

        // From here on, every early return drops (and so releases)
        // `ctx`.
        let mut ctx = engine
            .new_context()
            .map_err(SessionError::ContextCreationFailed)?;
        ctx.set_protocol()
            .map_err(SessionError::ProtocolBindingFailed)?;
        configure(&mut ctx, &info, &config.keyring_path).map_err(|source| {
            SessionError::EngineConfigFailed {
                path: config.keyring_path.clone(),
                source,
            }
        })?;
        ctx.set_armor(config.armored);

        info!(armored = config.armored, "session ready");
        Ok(Self {
            engine,
            config,
            ctx,
        })
    }

    /// Returns the session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Reports whether output is ASCII armored.
    pub fn armored(&self) -> bool {
        self.config.armored
    }

    /// Returns the keyring directory.
    pub fn keyring_path(&self) -> &Path {
        &self.config.keyring_path
    }

    /// Returns the engine's current OpenPGP settings.
    pub fn engine_info(&self) -> Option<EngineInfo> {
        self.engine
            .engine_info()
            .inspect_err(|err| warn!(%err, "engine info unavailable"))
            .ok()
    }

    /// Returns the engine version.
    pub fn version(&self) -> Option<String> {
        self.engine_info().map(|info| info.version)
    }

    /// Imports a single key.
    ///
    /// If the engine looked at anything other than exactly one key
    /// the outcome is [`ImportOutcome::NotFound`].
    #[instrument(skip_all, fields(len = material.len()))]
    pub fn import_key(&mut self, material: &[u8]) -> Result<ImportOutcome, ImportError> {
        let mut data = self
            .ctx
            .data_from_bytes(material)
            .map_err(ImportError::EngineFailure)?;
        let status = self
            .ctx
            .import(&mut data)
            .map_err(ImportError::EngineFailure)?;

        if status.considered != 1 {
            debug!(considered = status.considered, "not a single key");
            return Ok(ImportOutcome::NotFound {
                considered: status.considered,
            });
        }
        let outcome = match status.fingerprints.into_iter().next() {
            Some(fingerprint) => {
                info!(%fingerprint, "imported key");
                ImportOutcome::Imported { fingerprint }
            }
            None => {
                warn!("engine considered one key but reported no import");
                ImportOutcome::NotFound { considered: 1 }
            }
        };
        Ok(outcome)
    }

    /// Lists every key in the keyring.
    ///
    /// The result is a snapshot: it does not track later changes
    /// to the keyring.
    #[instrument(skip_all)]
    pub fn list_keys(&mut self) -> Result<Vec<KeyRecord>, ListError> {
        let mut listing = KeyListing::start(&mut self.ctx).map_err(ListError::EngineFailure)?;
        let mut keys = Vec::new();
        while let Some(key) = listing.next_key().map_err(ListError::EngineFailure)? {
            keys.push(key.record());
        }
        listing.finish().map_err(ListError::EngineFailure)?;
        debug!(count = keys.len(), "listed keys");
        Ok(keys)
    }

    /// Encrypts `plaintext` to the key with `fingerprint`.
    pub fn encrypt(
        &mut self,
        fingerprint: &str,
        plaintext: &str,
    ) -> Result<EncryptResult<Buffer<E>>, EncryptError> {
        self.encrypt_bytes(fingerprint, plaintext.as_bytes())
    }

    /// Encrypts `plaintext` to the key with `fingerprint`.
    ///
    /// The recipient is always trusted; validity is left to the
    /// engine. A recipient the engine refuses is reported as
    /// [`EncryptError::InvalidRecipient`].
    #[instrument(skip_all, fields(%fingerprint, len = plaintext.len()))]
    pub fn encrypt_bytes(
        &mut self,
        fingerprint: &str,
        plaintext: &[u8],
    ) -> Result<EncryptResult<Buffer<E>>, EncryptError> {
        let key = self
            .ctx
            .get_key(fingerprint)
            .map_err(EncryptError::EngineFailure)?
            .ok_or_else(|| EncryptError::UnknownRecipient(fingerprint.to_owned()))?;

        let mut plain = self
            .ctx
            .data_from_bytes(plaintext)
            .map_err(EncryptError::EngineFailure)?;
        let mut cipher = self.ctx.data_new().map_err(EncryptError::EngineFailure)?;

        let status = self
            .ctx
            .encrypt(&[&key], &mut plain, &mut cipher)
            .map_err(EncryptError::EngineFailure)?;
        if let Some(invalid) = status.invalid_recipients.into_iter().next() {
            warn!(fingerprint = %invalid.fingerprint, "engine refused recipient");
            return Err(EncryptError::InvalidRecipient {
                fingerprint: invalid.fingerprint,
                reason: invalid.reason,
            });
        }

        let ciphertext = cipher.into_buffer();
        debug!(len = ciphertext.as_ref().len(), "encrypted");
        Ok(EncryptResult { ciphertext })
    }

    /// Releases the session's context.
    ///
    /// This is the same as dropping the session.
    pub fn close(self) {}
}

impl<E: Engine> Drop for CryptoSession<E> {
    fn drop(&mut self) {
        debug!(keyring = %self.config.keyring_path.display(), "closing session");
    }
}

impl<E: Engine> fmt::Debug for CryptoSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Points the context at the engine executable and the keyring.
fn configure<C: Context>(
    ctx: &mut C,
    info: &EngineInfo,
    keyring: &Path,
) -> Result<(), ConfigError> {
    let keyring = prepare_keyring(keyring)?;
    ctx.set_engine_info(&info.file_name, &keyring)?;
    Ok(())
}

/// Creates the keyring directory if needed and checks that it is
/// a writable directory.
fn prepare_keyring(path: &Path) -> Result<std::path::PathBuf, ConfigError> {
    match fs::metadata(path) {
        Ok(meta) if !meta.is_dir() => return Err(ConfigError::NotADirectory),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "creating keyring directory");
            fs::create_dir_all(path)?;
        }
        Err(err) => return Err(err.into()),
    }
    let path = fs::canonicalize(path)?;
    check_writable(&path)?;
    Ok(path)
}

/// Checks that the current process can create files in `dir`.
fn check_writable(dir: &Path) -> Result<(), ConfigError> {
    let c_dir = CString::new(dir.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: FFI call, `c_dir` is NUL terminated.
    if unsafe { libc::access(c_dir.as_ptr(), libc::W_OK | libc::X_OK) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES | libc::EPERM | libc::EROFS) => Err(ConfigError::ReadOnly),
        _ => Err(err.into()),
    }
}

/// An active key listing.
///
/// The listing is ended when this is dropped.
struct KeyListing<'a, C: Context> {
    ctx: &'a mut C,
    done: bool,
}

impl<'a, C: Context> KeyListing<'a, C> {
    fn start(ctx: &'a mut C) -> Result<Self, EngineError> {
        ctx.keylist_start()?;
        Ok(Self { ctx, done: false })
    }

    fn next_key(&mut self) -> Result<Option<C::Key>, EngineError> {
        self.ctx.keylist_next()
    }

    fn finish(mut self) -> Result<(), EngineError> {
        self.done = true;
        self.ctx.keylist_end()
    }
}

impl<C: Context> Drop for KeyListing<'_, C> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(err) = self.ctx.keylist_end() {
            warn!(%err, "unable to end key listing");
        }
    }
}

/// The outcome of [`CryptoSession::import_key`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImportOutcome {
    /// Exactly one key was considered.
    Imported {
        /// The key's fingerprint.
        fingerprint: String,
    },
    /// The material did not hold exactly one key.
    NotFound {
        /// The number of keys the engine looked at.
        considered: u32,
    },
}

impl ImportOutcome {
    /// Reports whether a key was imported.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Imported { .. })
    }

    /// Returns the imported key's fingerprint.
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Imported { fingerprint } => Some(fingerprint),
            Self::NotFound { .. } => None,
        }
    }
}

/// The result of [`CryptoSession::encrypt`].
///
/// It owns the engine's ciphertext buffer, which is released by
/// the engine when this is dropped.
pub struct EncryptResult<B> {
    ciphertext: B,
}

impl<B: AsRef<[u8]>> EncryptResult<B> {
    /// Returns the ciphertext.
    pub fn ciphertext(&self) -> &[u8] {
        self.ciphertext.as_ref()
    }

    /// Copies the ciphertext into a host allocation.
    pub fn to_vec(&self) -> Vec<u8> {
        self.ciphertext().to_vec()
    }

    /// Returns the underlying engine buffer.
    pub fn into_inner(self) -> B {
        self.ciphertext
    }
}

impl<B: AsRef<[u8]>> Deref for EncryptResult<B> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.ciphertext()
    }
}

impl<B: AsRef<[u8]>> AsRef<[u8]> for EncryptResult<B> {
    fn as_ref(&self) -> &[u8] {
        self.ciphertext()
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for EncryptResult<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptResult")
            .field("len", &self.ciphertext().len())
            .finish()
    }
}
