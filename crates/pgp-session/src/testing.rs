//! An in-memory [`Engine`] for testing.
//!
//! [`FakeEngine`] counts every live handle it hands out, records the
//! order of engine calls, and can be told to fail at any [`Step`].
//! Keys live in a keyring shared by every context pointed at the
//! same home directory.
//!
//! Key material is one line per key:
//!
//! ```text
//! fake-key:<fingerprint>:<name>:<email>:<flags>
//! ```
//!
//! where `<flags>` is a comma separated subset of `revoked`,
//! `expired`, `disabled`, `invalid`, `secret` and `no-encrypt`.
//! Blank lines and lines starting with `#` are skipped. Anything
//! else is malformed.

#![cfg(any(test, feature = "testing"))]
#![cfg_attr(docsrs, doc(cfg(feature = "testing")))]

use std::{
    collections::{HashMap, VecDeque},
    ffi::CStr,
    fs, mem,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::trace;

use crate::{
    bootstrap::Latch,
    engine::{Context, Data, EncryptStatus, Engine, EngineInfo, ImportStatus, InvalidKey, Key},
    error::EngineError,
    key::KeyRecord,
};

const GENERAL: u32 = 1;
const UNUSABLE_PUBKEY: u32 = 53;
const NO_DATA: u32 = 58;

const ARMOR_BEGIN: &str = "-----BEGIN FAKE PGP MESSAGE-----";
const ARMOR_END: &str = "-----END FAKE PGP MESSAGE-----";
const MAGIC: &[u8] = b"FAKEPGP\0";

/// An engine call that [`FakeEngine`] can be told to fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// [`Engine::check_version`].
    CheckVersion,
    /// [`Engine::set_locale`].
    SetLocale,
    /// [`Engine::check_protocol`].
    CheckProtocol,
    /// [`Engine::engine_info`].
    EngineInfo,
    /// [`Engine::new_context`].
    NewContext,
    /// [`Context::set_protocol`].
    SetProtocol,
    /// [`Context::set_engine_info`].
    SetEngineInfo,
    /// [`Context::data_from_bytes`] and [`Context::data_new`].
    NewData,
    /// [`Context::import`].
    Import,
    /// [`Context::keylist_start`].
    KeylistStart,
    /// [`Context::get_key`].
    GetKey,
    /// [`Context::encrypt`].
    Encrypt,
}

/// Resource counters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Completed version checks.
    pub version_checks: usize,
    /// Contexts not yet released.
    pub live_contexts: usize,
    /// Contexts released.
    pub released_contexts: usize,
    /// Data objects not yet released.
    pub live_data: usize,
    /// Key handles not yet released.
    pub live_keys: usize,
    /// Key handles released.
    pub released_keys: usize,
    /// Ciphertext buffers not yet released.
    pub live_buffers: usize,
    /// Some context has a key listing in progress.
    pub listing_active: bool,
}

/// The settings applied to one context.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContextState {
    /// Bound to OpenPGP.
    pub openpgp: bool,
    /// ASCII armor is enabled.
    pub armored: bool,
    /// The configured engine executable.
    pub file_name: Option<PathBuf>,
    /// The configured keyring directory.
    pub home_dir: Option<PathBuf>,
    /// The context has been released.
    pub released: bool,
}

/// A key held by [`FakeEngine`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeKey {
    /// The fingerprint.
    pub fingerprint: String,
    /// The user ID name.
    pub name: Option<String>,
    /// The user ID email.
    pub email: Option<String>,
    /// Revoked.
    pub revoked: bool,
    /// Expired.
    pub expired: bool,
    /// Disabled.
    pub disabled: bool,
    /// Invalid.
    pub invalid: bool,
    /// The secret key is present.
    pub secret: bool,
    /// Usable for encryption.
    pub can_encrypt: bool,
}

impl FakeKey {
    /// Creates an encryption-capable key with no user ID.
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            name: None,
            email: None,
            revoked: false,
            expired: false,
            disabled: false,
            invalid: false,
            secret: false,
            can_encrypt: true,
        }
    }

    /// Sets the user ID.
    #[must_use]
    pub fn with_uid(mut self, name: &str, email: &str) -> Self {
        self.name = Some(name.to_owned());
        self.email = Some(email.to_owned());
        self
    }

    /// Marks the key as expired.
    #[must_use]
    pub fn with_expired(mut self) -> Self {
        self.expired = true;
        self
    }

    /// Marks the key as revoked.
    #[must_use]
    pub fn with_revoked(mut self) -> Self {
        self.revoked = true;
        self
    }

    /// Includes the secret key.
    #[must_use]
    pub fn with_secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Removes the encryption capability.
    #[must_use]
    pub fn without_encryption(mut self) -> Self {
        self.can_encrypt = false;
        self
    }

    /// Encodes the key as importable material.
    pub fn export(&self) -> Vec<u8> {
        let flags = [
            (self.revoked, "revoked"),
            (self.expired, "expired"),
            (self.disabled, "disabled"),
            (self.invalid, "invalid"),
            (self.secret, "secret"),
            (!self.can_encrypt, "no-encrypt"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect::<Vec<_>>()
        .join(",");
        format!(
            "fake-key:{}:{}:{}:{}\n",
            self.fingerprint,
            self.name.as_deref().unwrap_or_default(),
            self.email.as_deref().unwrap_or_default(),
            flags,
        )
        .into_bytes()
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.strip_prefix("fake-key:")?.split(':');
        let fingerprint = parts.next().filter(|s| !s.is_empty())?;
        let name = parts.next()?;
        let email = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
        let mut key = Self::new(fingerprint);
        key.name = non_empty(name);
        key.email = non_empty(email);
        for flag in flags.split(',').filter(|s| !s.is_empty()) {
            match flag {
                "revoked" => key.revoked = true,
                "expired" => key.expired = true,
                "disabled" => key.disabled = true,
                "invalid" => key.invalid = true,
                "secret" => key.secret = true,
                "no-encrypt" => key.can_encrypt = false,
                _ => return None,
            }
        }
        Some(key)
    }

    fn usable(&self) -> bool {
        self.can_encrypt && !(self.revoked || self.expired || self.disabled || self.invalid)
    }
}

#[derive(Debug, Default)]
struct State {
    fail: Option<Step>,
    keylist_fail_after: Option<usize>,
    calls: Vec<Step>,
    stats: Stats,
    contexts: Vec<ContextState>,
    keyrings: HashMap<PathBuf, Vec<FakeKey>>,
}

#[derive(Debug, Default)]
struct Inner {
    latch: Latch,
    state: Mutex<State>,
}

/// An in-memory OpenPGP engine.
///
/// Clones share all state, including the bootstrap latch.
#[derive(Clone, Debug, Default)]
pub struct FakeEngine {
    inner: Arc<Inner>,
}

impl FakeEngine {
    /// The version the engine reports.
    pub const VERSION: &'static str = "2.4.0-fake";
    /// The executable the engine reports.
    pub const FILE_NAME: &'static str = "/usr/bin/gpg-fake";

    /// Creates an engine with empty keyrings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `step` fail until [`clear_failure`][Self::clear_failure].
    pub fn fail_at(&self, step: Step) {
        self.state().fail = Some(step);
    }

    /// Makes key listings fail after `n` keys.
    pub fn fail_keylist_after(&self, n: usize) {
        self.state().keylist_fail_after = Some(n);
    }

    /// Removes injected failures.
    pub fn clear_failure(&self) {
        let mut state = self.state();
        state.fail = None;
        state.keylist_fail_after = None;
    }

    /// Returns the resource counters.
    pub fn stats(&self) -> Stats {
        self.state().stats.clone()
    }

    /// Returns the engine calls made so far, in order.
    pub fn calls(&self) -> Vec<Step> {
        self.state().calls.clone()
    }

    /// Returns the settings of the `n`th context created.
    pub fn context_state(&self, n: usize) -> Option<ContextState> {
        self.state().contexts.get(n).cloned()
    }

    /// Decrypts `ciphertext` with a secret key from the keyring at
    /// `home_dir`.
    pub fn decrypt(&self, home_dir: &Path, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let home_dir = fs::canonicalize(home_dir).ok()?;
        let (fingerprint, plain) = unseal(ciphertext)?;
        let state = self.state();
        state
            .keyrings
            .get(&home_dir)?
            .iter()
            .any(|k| k.secret && k.fingerprint == fingerprint)
            .then_some(plain)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `step` and fails it if asked to.
    fn step(&self, step: Step) -> Result<(), EngineError> {
        let mut state = self.state();
        state.calls.push(step);
        trace!(?step, "fake engine call");
        if state.fail == Some(step) {
            return Err(EngineError::new(GENERAL, "General error"));
        }
        Ok(())
    }
}

impl Engine for FakeEngine {
    type Context = FakeContext;

    fn latch(&self) -> &Latch {
        &self.inner.latch
    }

    fn check_version(&self) -> bool {
        if self.step(Step::CheckVersion).is_err() {
            return false;
        }
        self.state().stats.version_checks += 1;
        true
    }

    fn set_locale(&self, _ctype: &CStr) -> Result<(), EngineError> {
        self.step(Step::SetLocale)
    }

    fn check_protocol(&self) -> Result<(), EngineError> {
        self.step(Step::CheckProtocol)
    }

    fn engine_info(&self) -> Result<EngineInfo, EngineError> {
        self.step(Step::EngineInfo)?;
        Ok(EngineInfo {
            version: Self::VERSION.to_owned(),
            file_name: PathBuf::from(Self::FILE_NAME),
            home_dir: None,
            req_version: Some("1.0.0".to_owned()),
        })
    }

    fn new_context(&self) -> Result<FakeContext, EngineError> {
        self.step(Step::NewContext)?;
        let mut state = self.state();
        let id = state.contexts.len();
        state.contexts.push(ContextState::default());
        state.stats.live_contexts += 1;
        Ok(FakeContext {
            engine: self.clone(),
            id,
            listing: None,
        })
    }
}

/// A [`FakeEngine`] context.
#[derive(Debug)]
pub struct FakeContext {
    engine: FakeEngine,
    id: usize,
    listing: Option<Listing>,
}

#[derive(Debug)]
struct Listing {
    keys: VecDeque<FakeKey>,
    returned: usize,
}

impl FakeContext {
    fn update(&self, f: impl FnOnce(&mut ContextState)) {
        if let Some(ctx) = self.engine.state().contexts.get_mut(self.id) {
            f(ctx)
        }
    }

    fn settings(&self) -> ContextState {
        self.engine
            .state()
            .contexts
            .get(self.id)
            .cloned()
            .unwrap_or_default()
    }

    fn keyring(&self) -> Result<Vec<FakeKey>, EngineError> {
        let home_dir = self
            .settings()
            .home_dir
            .ok_or_else(|| EngineError::new(EngineError::INV_VALUE, "Invalid value"))?;
        Ok(self
            .engine
            .state()
            .keyrings
            .get(&home_dir)
            .cloned()
            .unwrap_or_default())
    }

    fn key(&self, key: FakeKey) -> FakeKeyHandle {
        self.engine.state().stats.live_keys += 1;
        FakeKeyHandle {
            engine: self.engine.clone(),
            key,
        }
    }

    fn data(&self, bytes: Vec<u8>) -> Result<FakeData, EngineError> {
        self.engine.step(Step::NewData)?;
        self.engine.state().stats.live_data += 1;
        Ok(FakeData {
            engine: self.engine.clone(),
            bytes,
        })
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        let mut state = self.engine.state();
        if self.listing.take().is_some() {
            state.stats.listing_active = false;
        }
        state.stats.live_contexts -= 1;
        state.stats.released_contexts += 1;
        if let Some(ctx) = state.contexts.get_mut(self.id) {
            assert!(!ctx.released, "context released twice");
            ctx.released = true;
        }
    }
}

impl Context for FakeContext {
    type Key = FakeKeyHandle;
    type Data = FakeData;

    fn set_protocol(&mut self) -> Result<(), EngineError> {
        self.engine.step(Step::SetProtocol)?;
        self.update(|ctx| ctx.openpgp = true);
        Ok(())
    }

    fn set_engine_info(&mut self, file_name: &Path, home_dir: &Path) -> Result<(), EngineError> {
        self.engine.step(Step::SetEngineInfo)?;
        self.update(|ctx| {
            ctx.file_name = Some(file_name.to_owned());
            ctx.home_dir = Some(home_dir.to_owned());
        });
        Ok(())
    }

    fn set_armor(&mut self, armored: bool) {
        self.update(|ctx| ctx.armored = armored);
    }

    fn data_from_bytes(&mut self, bytes: &[u8]) -> Result<FakeData, EngineError> {
        self.data(bytes.to_vec())
    }

    fn data_new(&mut self) -> Result<FakeData, EngineError> {
        self.data(Vec::new())
    }

    fn import(&mut self, data: &mut FakeData) -> Result<ImportStatus, EngineError> {
        self.engine.step(Step::Import)?;
        let text = std::str::from_utf8(&data.bytes)
            .map_err(|_| EngineError::new(NO_DATA, "No data"))?;
        let keys = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| FakeKey::parse(line).ok_or_else(|| EngineError::new(NO_DATA, "No data")))
            .collect::<Result<Vec<_>, _>>()?;

        let home_dir = self
            .settings()
            .home_dir
            .ok_or_else(|| EngineError::new(EngineError::INV_VALUE, "Invalid value"))?;
        let mut state = self.engine.state();
        let keyring = state.keyrings.entry(home_dir).or_default();
        let mut status = ImportStatus {
            considered: u32::try_from(keys.len()).unwrap_or(u32::MAX),
            fingerprints: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            status.fingerprints.push(key.fingerprint.clone());
            keyring.retain(|k| k.fingerprint != key.fingerprint);
            keyring.push(key);
        }
        Ok(status)
    }

    fn keylist_start(&mut self) -> Result<(), EngineError> {
        self.engine.step(Step::KeylistStart)?;
        let keys = self.keyring()?.into();
        self.listing = Some(Listing { keys, returned: 0 });
        self.engine.state().stats.listing_active = true;
        Ok(())
    }

    fn keylist_next(&mut self) -> Result<Option<FakeKeyHandle>, EngineError> {
        let fail_after = self.engine.state().keylist_fail_after;
        let listing = self
            .listing
            .as_mut()
            .ok_or_else(|| EngineError::new(EngineError::INV_VALUE, "Invalid value"))?;
        if fail_after == Some(listing.returned) {
            return Err(EngineError::new(GENERAL, "General error"));
        }
        let Some(key) = listing.keys.pop_front() else {
            return Ok(None);
        };
        listing.returned += 1;
        Ok(Some(self.key(key)))
    }

    fn keylist_end(&mut self) -> Result<(), EngineError> {
        self.listing = None;
        self.engine.state().stats.listing_active = false;
        Ok(())
    }

    fn get_key(&mut self, fingerprint: &str) -> Result<Option<FakeKeyHandle>, EngineError> {
        self.engine.step(Step::GetKey)?;
        let key = self
            .keyring()?
            .into_iter()
            .find(|k| k.fingerprint.eq_ignore_ascii_case(fingerprint));
        Ok(key.map(|key| self.key(key)))
    }

    fn encrypt(
        &mut self,
        recipients: &[&FakeKeyHandle],
        plain: &mut FakeData,
        cipher: &mut FakeData,
    ) -> Result<EncryptStatus, EngineError> {
        self.engine.step(Step::Encrypt)?;
        let invalid_recipients = recipients
            .iter()
            .filter(|r| !r.key.usable())
            .map(|r| InvalidKey {
                fingerprint: r.key.fingerprint.clone(),
                reason: Some(EngineError::new(UNUSABLE_PUBKEY, "Unusable public key")),
            })
            .collect::<Vec<_>>();
        if !invalid_recipients.is_empty() {
            return Ok(EncryptStatus { invalid_recipients });
        }
        let Some(recipient) = recipients.first() else {
            return Err(EngineError::new(EngineError::INV_VALUE, "Invalid value"));
        };
        let armored = self.settings().armored;
        cipher.bytes = seal(&recipient.key.fingerprint, &plain.bytes, armored);
        Ok(EncryptStatus::default())
    }
}

/// A [`FakeEngine`] key handle.
#[derive(Debug)]
pub struct FakeKeyHandle {
    engine: FakeEngine,
    key: FakeKey,
}

impl Drop for FakeKeyHandle {
    fn drop(&mut self) {
        let mut state = self.engine.state();
        state.stats.live_keys -= 1;
        state.stats.released_keys += 1;
    }
}

impl Key for FakeKeyHandle {
    fn record(&self) -> KeyRecord {
        let key = &self.key;
        KeyRecord {
            fingerprint: Some(key.fingerprint.clone()),
            email: key.email.clone(),
            name: key.name.clone(),
            revoked: key.revoked,
            expired: key.expired,
            disabled: key.disabled,
            invalid: key.invalid,
            can_encrypt: key.can_encrypt,
            secret: key.secret,
        }
    }
}

/// A [`FakeEngine`] data object.
#[derive(Debug)]
pub struct FakeData {
    engine: FakeEngine,
    bytes: Vec<u8>,
}

impl Drop for FakeData {
    fn drop(&mut self) {
        self.engine.state().stats.live_data -= 1;
    }
}

impl Data for FakeData {
    type Buffer = FakeBuffer;

    fn into_buffer(mut self) -> FakeBuffer {
        let bytes = mem::take(&mut self.bytes);
        let engine = self.engine.clone();
        drop(self);
        engine.state().stats.live_buffers += 1;
        FakeBuffer { engine, bytes }
    }
}

/// A [`FakeEngine`] ciphertext buffer.
#[derive(Debug)]
pub struct FakeBuffer {
    engine: FakeEngine,
    bytes: Vec<u8>,
}

impl AsRef<[u8]> for FakeBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for FakeBuffer {
    fn drop(&mut self) {
        self.engine.state().stats.live_buffers -= 1;
    }
}

fn seal(fingerprint: &str, plain: &[u8], armored: bool) -> Vec<u8> {
    let raw = [MAGIC, fingerprint.as_bytes(), b"\0", plain].concat();
    if !armored {
        return raw;
    }
    let mut out = String::from(ARMOR_BEGIN);
    out.push('\n');
    for (i, b) in raw.iter().enumerate() {
        if i > 0 && i % 32 == 0 {
            out.push('\n');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out.push('\n');
    out.push_str(ARMOR_END);
    out.push('\n');
    out.into_bytes()
}

fn unseal(ciphertext: &[u8]) -> Option<(String, Vec<u8>)> {
    let raw = match std::str::from_utf8(ciphertext) {
        Ok(text) if text.starts_with(ARMOR_BEGIN) => {
            let body = text
                .strip_prefix(ARMOR_BEGIN)?
                .trim()
                .strip_suffix(ARMOR_END)?;
            let hex: String = body.split_whitespace().collect();
            (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
                .collect::<Option<Vec<u8>>>()?
        }
        _ => ciphertext.to_vec(),
    };
    let rest = raw.strip_prefix(MAGIC)?;
    let nul = rest.iter().position(|&b| b == 0)?;
    let (fingerprint, plain) = rest.split_at(nul);
    let fingerprint = String::from_utf8(fingerprint.to_vec()).ok()?;
    Some((fingerprint, plain.get(1..)?.to_vec()))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_export() {
        let key = FakeKey::new("AAAA")
            .with_uid("Alice", "alice@example.org")
            .with_revoked()
            .without_encryption();
        let line = String::from_utf8(key.export()).expect("export should be UTF-8");
        assert_eq!(FakeKey::parse(line.trim()), Some(key));
    }

    #[test]
    fn test_parse_rejects_junk() {
        for line in [
            "fake-key:",
            "fake-key:AAAA",
            "fake-key:AAAA:::bogus",
            "fake-key:AAAA::::extra:",
            "real-key:AAAA:::",
        ] {
            assert_eq!(FakeKey::parse(line), None, "{line}");
        }
    }

    #[test]
    fn test_seal_unseal() {
        for armored in [false, true] {
            let sealed = seal("AAAA", b"hello\0world", armored);
            assert_eq!(
                unseal(&sealed),
                Some(("AAAA".to_owned(), b"hello\0world".to_vec())),
                "armored = {armored}"
            );
        }
        assert_eq!(unseal(b"garbage"), None);
    }
}
