//! One-time engine bootstrap.
//!
//! The engine requires its version check to be the first call into
//! it and to happen once per process. A [`Latch`] runs the bootstrap
//! sequence at most once successfully and serializes concurrent
//! callers:
//!
//! 1. Set the process locale from the environment.
//! 2. Run the engine's version check.
//! 3. Hand the `LC_CTYPE` locale to the engine.
//! 4. Check that the engine supports OpenPGP.
//!
//! A failed bootstrap is not recorded; the next call starts over.

use std::ffi::{CStr, CString};

use spin::Once;
use tracing::{debug, instrument, warn};

use crate::{engine::Engine, error::BootstrapError};

/// Guards an engine's bootstrap.
#[derive(Debug)]
pub struct Latch {
    once: Once,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    /// Creates a latch that has not run yet.
    pub const fn new() -> Self {
        Self { once: Once::new() }
    }

    /// Reports whether the bootstrap has completed.
    pub fn is_ready(&self) -> bool {
        self.once.is_completed()
    }

    /// Bootstraps `engine` unless it already has been.
    #[instrument(skip_all)]
    pub fn ensure<E: Engine + ?Sized>(&self, engine: &E) -> Result<(), BootstrapError> {
        if self.is_ready() {
            return Ok(());
        }
        self.once.try_call_once(|| bootstrap(engine)).map(|&()| ())
    }
}

fn bootstrap<E: Engine + ?Sized>(engine: &E) -> Result<(), BootstrapError> {
    let ctype = process_locale().ok_or(BootstrapError::LocaleUnavailable(None))?;
    debug!(?ctype, "process locale");

    if !engine.check_version() {
        return Err(BootstrapError::VersionCheckFailed);
    }

    engine
        .set_locale(&ctype)
        .map_err(|err| BootstrapError::LocaleUnavailable(Some(err)))?;

    engine
        .check_protocol()
        .map_err(BootstrapError::UnsupportedProtocol)?;

    debug!("engine ready");
    Ok(())
}

/// Sets the process locale from the environment and returns the
/// resulting `LC_CTYPE` locale.
fn process_locale() -> Option<CString> {
    // SAFETY: FFI call, the argument is NUL terminated.
    let all = unsafe { libc::setlocale(libc::LC_ALL, c"".as_ptr()) };
    if all.is_null() {
        warn!("environment locale is unavailable, keeping the current locale");
    }

    // SAFETY: FFI call, a null locale only queries.
    let ctype = unsafe { libc::setlocale(libc::LC_CTYPE, core::ptr::null()) };
    if ctype.is_null() {
        return None;
    }
    // SAFETY: `setlocale` returns a NUL terminated string that
    // stays valid until the next `setlocale` call. It is copied
    // before then.
    Some(unsafe { CStr::from_ptr(ctype) }.to_owned())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, Step};

    #[test_log::test]
    fn test_runs_once() {
        let eng = FakeEngine::new();
        assert!(!eng.latch().is_ready());
        for _ in 0..3 {
            eng.latch().ensure(&eng).expect("bootstrap should succeed");
        }
        assert!(eng.latch().is_ready());
        assert_eq!(eng.stats().version_checks, 1);
    }

    #[test_log::test]
    fn test_version_check_comes_first() {
        let eng = FakeEngine::new();
        eng.latch().ensure(&eng).expect("bootstrap should succeed");
        assert_eq!(
            eng.calls(),
            [Step::CheckVersion, Step::SetLocale, Step::CheckProtocol]
        );
    }

    #[test_log::test]
    fn test_version_check_failure() {
        let eng = FakeEngine::new();
        eng.fail_at(Step::CheckVersion);
        let err = eng.latch().ensure(&eng).expect_err("bootstrap should fail");
        assert!(matches!(err, BootstrapError::VersionCheckFailed), "{err:?}");
        assert!(!eng.latch().is_ready());
        // Nothing else may be called before the version check.
        assert_eq!(eng.calls(), [Step::CheckVersion]);
    }

    #[test_log::test]
    fn test_locale_failure() {
        let eng = FakeEngine::new();
        eng.fail_at(Step::SetLocale);
        let err = eng.latch().ensure(&eng).expect_err("bootstrap should fail");
        assert!(
            matches!(err, BootstrapError::LocaleUnavailable(Some(_))),
            "{err:?}"
        );
    }

    #[test_log::test]
    fn test_unsupported_protocol() {
        let eng = FakeEngine::new();
        eng.fail_at(Step::CheckProtocol);
        let err = eng.latch().ensure(&eng).expect_err("bootstrap should fail");
        assert!(
            matches!(err, BootstrapError::UnsupportedProtocol(_)),
            "{err:?}"
        );
    }

    #[test_log::test]
    fn test_retries_after_failure() {
        let eng = FakeEngine::new();
        eng.fail_at(Step::CheckProtocol);
        eng.latch().ensure(&eng).expect_err("bootstrap should fail");

        eng.clear_failure();
        eng.latch().ensure(&eng).expect("bootstrap should succeed");
        assert!(eng.latch().is_ready());
        assert_eq!(eng.stats().version_checks, 2);
    }

    #[test_log::test]
    fn test_concurrent_callers_bootstrap_once() {
        let eng = FakeEngine::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| eng.latch().ensure(&eng).expect("bootstrap should succeed"));
            }
        });
        assert_eq!(eng.stats().version_checks, 1);
    }
}
