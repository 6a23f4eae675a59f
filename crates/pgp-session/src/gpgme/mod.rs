//! The GPGME engine.
//!
//! GPGME keeps process-wide state, so there is exactly one engine:
//! [`Gpgme`]. It is a zero-sized handle; copies share the same
//! bootstrap [`Latch`].

mod context;
mod handle;

use core::ptr;
use std::{
    ffi::{CStr, c_char},
    path::PathBuf,
};

use gpgme_sys as sys;
use tracing::{debug, instrument};

pub use self::{
    context::OwnedContext,
    handle::{EngineBuffer, OwnedData, OwnedKey},
};
use crate::{
    bootstrap::Latch,
    config::SessionConfig,
    engine::{Engine, EngineInfo},
    error::{BootstrapError, EngineError, SessionError},
    session::CryptoSession,
};

static LATCH: Latch = Latch::new();

/// The engine's "invalid crypto engine" code.
const INV_ENGINE: u32 = 150;

/// Masks the error source out of a `gpgme_error_t`.
const CODE_MASK: u32 = 0xffff;

/// The process-wide GPGME engine.
#[derive(Copy, Clone, Debug, Default)]
pub struct Gpgme;

impl Engine for Gpgme {
    type Context = OwnedContext;

    fn latch(&self) -> &Latch {
        &LATCH
    }

    fn check_version(&self) -> bool {
        // SAFETY: FFI call, a null minimum version only
        // initializes the library.
        let version = unsafe { sys::gpgme_check_version(ptr::null()) };
        if version.is_null() {
            return false;
        }
        // SAFETY: GPGME returns a static NUL terminated string.
        debug!(version = ?unsafe { CStr::from_ptr(version) }, "library version");
        true
    }

    fn set_locale(&self, ctype: &CStr) -> Result<(), EngineError> {
        // SAFETY: FFI call, a null context sets the default for
        // new contexts and `ctype` is NUL terminated.
        check(unsafe { sys::gpgme_set_locale(ptr::null_mut(), libc::LC_CTYPE, ctype.as_ptr()) })
    }

    fn check_protocol(&self) -> Result<(), EngineError> {
        // SAFETY: FFI call, no invariants.
        check(unsafe { sys::gpgme_engine_check_version(sys::GPGME_PROTOCOL_OpenPGP) })
    }

    #[instrument(skip_all)]
    fn engine_info(&self) -> Result<EngineInfo, EngineError> {
        let mut info: sys::gpgme_engine_info_t = ptr::null_mut();
        // SAFETY: FFI call, `info` is a valid out pointer.
        check(unsafe { sys::gpgme_get_engine_info(&mut info) })?;

        // SAFETY: GPGME owns the list and keeps it alive until
        // the engine settings change, which this crate never does
        // for the process-wide defaults. Every entry is copied out
        // before returning.
        while let Some(entry) = unsafe { info.as_ref() } {
            if entry.protocol == sys::GPGME_PROTOCOL_OpenPGP {
                let (Some(version), Some(file_name)) =
                    (string(entry.version), string(entry.file_name))
                else {
                    break;
                };
                return Ok(EngineInfo {
                    version,
                    file_name: PathBuf::from(file_name),
                    home_dir: string(entry.home_dir).map(PathBuf::from),
                    req_version: string(entry.req_version),
                });
            }
            info = entry.next;
        }
        Err(EngineError::new(INV_ENGINE, "Invalid crypto engine"))
    }

    fn new_context(&self) -> Result<OwnedContext, EngineError> {
        let mut raw: sys::gpgme_ctx_t = ptr::null_mut();
        // SAFETY: FFI call, `raw` is a valid out pointer.
        check(unsafe { sys::gpgme_new(&mut raw) })?;
        OwnedContext::from_raw(raw)
    }
}

/// Bootstraps GPGME if it has not been already.
///
/// [`CryptoSession::new`] does this itself; calling it first is
/// only useful to surface bootstrap failures early.
pub fn ensure_ready() -> Result<(), BootstrapError> {
    LATCH.ensure(&Gpgme)
}

impl CryptoSession<Gpgme> {
    /// Creates a GPGME session for `config`.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_engine(Gpgme, config)
    }
}

/// Converts a GPGME status into a `Result`.
fn check(err: sys::gpgme_error_t) -> Result<(), EngineError> {
    if err == 0 { Ok(()) } else { Err(error(err)) }
}

/// Converts a non-zero GPGME status into an [`EngineError`].
fn error(err: sys::gpgme_error_t) -> EngineError {
    let mut buf = [0u8; 256];
    // SAFETY: FFI call, `buf` is writable for its full length.
    // The result is always NUL terminated, even when truncated.
    unsafe { sys::gpgme_strerror_r(err, buf.as_mut_ptr().cast(), buf.len()) };
    let description = CStr::from_bytes_until_nul(&buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    EngineError::new(err & CODE_MASK, description)
}

/// Copies a GPGME owned string, if any.
fn string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: GPGME strings are NUL terminated and outlive the
    // structure that holds them.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
