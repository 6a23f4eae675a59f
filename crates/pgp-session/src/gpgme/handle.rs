use core::{fmt, mem::ManuallyDrop, slice};

use buggy::bug;
use gpgme_sys as sys;

use super::string;
use crate::{
    engine::{Data, Key},
    error::EngineError,
    key::KeyRecord,
};

/// An owned reference to a `gpgme_key_t`.
#[derive(Debug)]
pub struct OwnedKey {
    raw: sys::gpgme_key_t,
}

// SAFETY: keys are reference counted and immutable once listed.
unsafe impl Send for OwnedKey {}

impl OwnedKey {
    /// Takes ownership of a key reference handed out by GPGME.
    pub(super) fn from_raw(raw: sys::gpgme_key_t) -> Result<Self, EngineError> {
        if raw.is_null() {
            bug!("GPGME returned a null key");
        }
        Ok(Self { raw })
    }

    pub(super) fn as_raw(&self) -> sys::gpgme_key_t {
        self.raw
    }
}

impl Drop for OwnedKey {
    fn drop(&mut self) {
        // SAFETY: FFI call, this handle owns one reference.
        unsafe { sys::gpgme_key_unref(self.as_raw()) }
    }
}

impl Key for OwnedKey {
    fn record(&self) -> KeyRecord {
        // SAFETY: the handle holds a reference, so the key is
        // valid.
        let key = unsafe { &*self.raw };
        // SAFETY: the first subkey and user ID belong to `key`.
        let (subkey, uid) = unsafe { (key.subkeys.as_ref(), key.uids.as_ref()) };
        KeyRecord {
            fingerprint: subkey.and_then(|s| string(s.fpr)),
            email: uid.and_then(|u| string(u.email)),
            name: uid.and_then(|u| string(u.name)),
            revoked: key.revoked(),
            expired: key.expired(),
            disabled: key.disabled(),
            invalid: key.invalid(),
            can_encrypt: key.can_encrypt(),
            secret: key.secret(),
        }
    }
}

/// An owned `gpgme_data_t`.
#[derive(Debug)]
pub struct OwnedData {
    raw: sys::gpgme_data_t,
}

// SAFETY: data objects are not tied to a thread.
unsafe impl Send for OwnedData {}

impl OwnedData {
    /// Takes ownership of a data object created by GPGME.
    pub(super) fn from_raw(raw: sys::gpgme_data_t) -> Result<Self, EngineError> {
        if raw.is_null() {
            bug!("GPGME returned a null data object");
        }
        Ok(Self { raw })
    }

    pub(super) fn as_raw(&self) -> sys::gpgme_data_t {
        self.raw
    }
}

impl Drop for OwnedData {
    fn drop(&mut self) {
        // SAFETY: FFI call, the object is owned and released
        // exactly once.
        unsafe { sys::gpgme_data_release(self.as_raw()) }
    }
}

impl Data for OwnedData {
    type Buffer = EngineBuffer;

    fn into_buffer(self) -> EngineBuffer {
        let this = ManuallyDrop::new(self);
        let mut len = 0;
        // SAFETY: FFI call, this releases the object, so `Drop`
        // must not run.
        let ptr = unsafe { sys::gpgme_data_release_and_get_mem(this.as_raw(), &mut len) };
        EngineBuffer {
            ptr: ptr.cast(),
            len,
        }
    }
}

/// Memory allocated by GPGME.
///
/// It is handed back to GPGME when dropped.
pub struct EngineBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the buffer is uniquely owned plain memory.
unsafe impl Send for EngineBuffer {}

impl AsRef<[u8]> for EngineBuffer {
    fn as_ref(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: GPGME handed over `len` initialized bytes at
        // `ptr`, which stay valid until `Drop`.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for EngineBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: FFI call, the memory came from GPGME and is
        // freed exactly once.
        unsafe { sys::gpgme_free(self.ptr.cast()) }
    }
}

impl fmt::Debug for EngineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
