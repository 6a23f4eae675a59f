use core::ptr;
use std::{
    ffi::{CString, c_int},
    path::Path,
};

use buggy::{BugExt, bug};
use gpgme_sys as sys;
use tracing::trace;

use super::{
    check, error,
    handle::{OwnedData, OwnedKey},
    string,
};
use crate::{
    engine::{Context, EncryptStatus, ImportStatus, InvalidKey},
    error::EngineError,
};

/// An owned `gpgme_ctx_t`.
#[derive(Debug)]
pub struct OwnedContext {
    raw: sys::gpgme_ctx_t,
}

// SAFETY: a GPGME context may be used from any thread as long as
// it is used by one thread at a time, which `&mut self` ensures.
unsafe impl Send for OwnedContext {}

impl OwnedContext {
    /// Takes ownership of a context created by GPGME.
    pub(super) fn from_raw(raw: sys::gpgme_ctx_t) -> Result<Self, EngineError> {
        if raw.is_null() {
            bug!("GPGME returned a null context");
        }
        Ok(Self { raw })
    }

    fn as_raw(&self) -> sys::gpgme_ctx_t {
        self.raw
    }
}

impl Drop for OwnedContext {
    fn drop(&mut self) {
        trace!("releasing context");
        // SAFETY: FFI call, the context is owned and released
        // exactly once.
        unsafe { sys::gpgme_release(self.as_raw()) }
    }
}

impl Context for OwnedContext {
    type Key = OwnedKey;
    type Data = OwnedData;

    fn set_protocol(&mut self) -> Result<(), EngineError> {
        // SAFETY: FFI call, the context is valid.
        check(unsafe { sys::gpgme_set_protocol(self.as_raw(), sys::GPGME_PROTOCOL_OpenPGP) })
    }

    fn set_engine_info(&mut self, file_name: &Path, home_dir: &Path) -> Result<(), EngineError> {
        let file_name = path_to_cstring(file_name)?;
        let home_dir = path_to_cstring(home_dir)?;
        // SAFETY: FFI call, the context is valid and both strings
        // are NUL terminated. GPGME copies them.
        check(unsafe {
            sys::gpgme_ctx_set_engine_info(
                self.as_raw(),
                sys::GPGME_PROTOCOL_OpenPGP,
                file_name.as_ptr(),
                home_dir.as_ptr(),
            )
        })
    }

    fn set_armor(&mut self, armored: bool) {
        // SAFETY: FFI call, the context is valid.
        unsafe { sys::gpgme_set_armor(self.as_raw(), c_int::from(armored)) }
    }

    fn data_from_bytes(&mut self, bytes: &[u8]) -> Result<OwnedData, EngineError> {
        if bytes.is_empty() {
            return self.data_new();
        }
        let mut raw: sys::gpgme_data_t = ptr::null_mut();
        // SAFETY: FFI call, `raw` is a valid out pointer and
        // `bytes` is readable for its full length. `copy` is set,
        // so GPGME does not keep the pointer.
        check(unsafe {
            sys::gpgme_data_new_from_mem(&mut raw, bytes.as_ptr().cast(), bytes.len(), 1)
        })?;
        OwnedData::from_raw(raw)
    }

    fn data_new(&mut self) -> Result<OwnedData, EngineError> {
        let mut raw: sys::gpgme_data_t = ptr::null_mut();
        // SAFETY: FFI call, `raw` is a valid out pointer.
        check(unsafe { sys::gpgme_data_new(&mut raw) })?;
        OwnedData::from_raw(raw)
    }

    fn import(&mut self, data: &mut OwnedData) -> Result<ImportStatus, EngineError> {
        // SAFETY: FFI call, the context and data are valid.
        check(unsafe { sys::gpgme_op_import(self.as_raw(), data.as_raw()) })?;

        // SAFETY: FFI call, the context is valid. The result
        // belongs to the context and lives until its next
        // operation.
        let result = unsafe { sys::gpgme_op_import_result(self.as_raw()).as_ref() }
            .assume("`gpgme_op_import` succeeded without a result")?;

        let mut fingerprints = Vec::new();
        let mut next = result.imports;
        // SAFETY: the list belongs to `result`, see above.
        while let Some(status) = unsafe { next.as_ref() } {
            if let Some(fpr) = string(status.fpr) {
                fingerprints.push(fpr);
            }
            next = status.next;
        }
        Ok(ImportStatus {
            considered: u32::try_from(result.considered).unwrap_or(0),
            fingerprints,
        })
    }

    fn keylist_start(&mut self) -> Result<(), EngineError> {
        // SAFETY: FFI call, the context is valid and a null
        // pattern matches every key.
        check(unsafe { sys::gpgme_op_keylist_start(self.as_raw(), ptr::null(), 0) })
    }

    fn keylist_next(&mut self) -> Result<Option<OwnedKey>, EngineError> {
        let mut raw: sys::gpgme_key_t = ptr::null_mut();
        // SAFETY: FFI call, the context is valid and `raw` is a
        // valid out pointer.
        let err = unsafe { sys::gpgme_op_keylist_next(self.as_raw(), &mut raw) };
        match check(err) {
            Ok(()) => OwnedKey::from_raw(raw).map(Some),
            Err(err) if err.is_eof() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn keylist_end(&mut self) -> Result<(), EngineError> {
        // SAFETY: FFI call, the context is valid.
        check(unsafe { sys::gpgme_op_keylist_end(self.as_raw()) })
    }

    fn get_key(&mut self, fingerprint: &str) -> Result<Option<OwnedKey>, EngineError> {
        // GPGME treats an empty pattern as "any key".
        if fingerprint.is_empty() {
            return Ok(None);
        }
        let Ok(fpr) = CString::new(fingerprint) else {
            return Ok(None);
        };
        let mut raw: sys::gpgme_key_t = ptr::null_mut();
        // SAFETY: FFI call, the context is valid, `fpr` is NUL
        // terminated and `raw` is a valid out pointer.
        let err = unsafe { sys::gpgme_get_key(self.as_raw(), fpr.as_ptr(), &mut raw, 0) };
        match check(err) {
            Ok(()) => OwnedKey::from_raw(raw).map(Some),
            Err(err) if err.is_eof() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn encrypt(
        &mut self,
        recipients: &[&OwnedKey],
        plain: &mut OwnedData,
        cipher: &mut OwnedData,
    ) -> Result<EncryptStatus, EngineError> {
        let mut keys = recipients
            .iter()
            .map(|key| key.as_raw())
            .chain([ptr::null_mut()])
            .collect::<Vec<_>>();
        // SAFETY: FFI call, the context and data are valid and
        // `keys` is a null terminated array of valid keys that
        // outlives the call.
        check(unsafe {
            sys::gpgme_op_encrypt(
                self.as_raw(),
                keys.as_mut_ptr(),
                sys::GPGME_ENCRYPT_ALWAYS_TRUST,
                plain.as_raw(),
                cipher.as_raw(),
            )
        })?;

        // SAFETY: FFI call, the context is valid. The result
        // belongs to the context and lives until its next
        // operation.
        let result = unsafe { sys::gpgme_op_encrypt_result(self.as_raw()).as_ref() }
            .assume("`gpgme_op_encrypt` succeeded without a result")?;

        let mut invalid_recipients = Vec::new();
        let mut next = result.invalid_recipients;
        // SAFETY: the list belongs to `result`, see above.
        while let Some(key) = unsafe { next.as_ref() } {
            invalid_recipients.push(InvalidKey {
                fingerprint: string(key.fpr).unwrap_or_default(),
                reason: (key.reason != 0).then(|| error(key.reason)),
            });
            next = key.next;
        }
        Ok(EncryptStatus { invalid_recipients })
    }
}

fn path_to_cstring(path: &Path) -> Result<CString, EngineError> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| EngineError::new(EngineError::INV_VALUE, "Invalid value"))
}
