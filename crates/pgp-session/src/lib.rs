//! An OpenPGP session over GPGME.
//!
//! A [`CryptoSession`] owns one engine context configured for one
//! keyring directory. It can import keys into the keyring, list
//! the keys in it, and encrypt to one of them.
//!
//! ```ignore
//! use pgp_session::{CryptoSession, SessionConfig};
//!
//! let mut session = CryptoSession::new(SessionConfig::new("/srv/keys"))?;
//! let outcome = session.import_key(include_bytes!("alice.asc"))?;
//! let fpr = outcome.fingerprint().expect("one key");
//! let ciphertext = session.encrypt(fpr, "hello")?;
//! ```
//!
//! The engine is bootstrapped once per process, the first time a
//! session is created.
//!
//! # Features
//!
//! - `gpgme`: Enable the GPGME engine. Requires libgpgme.
//! - `testing`: Enable the in-memory engine in [`testing`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::missing_panics_doc,
    clippy::ptr_as_ptr,
    clippy::string_slice,
    clippy::undocumented_unsafe_blocks,
    clippy::unimplemented,
    clippy::unwrap_used,
    clippy::wildcard_imports,
    missing_docs
)]

mod bootstrap;
mod config;
pub mod engine;
mod error;
mod key;
mod session;
pub mod testing;

cfg_if::cfg_if! {
    if #[cfg(feature = "gpgme")] {
        #[cfg_attr(docsrs, doc(cfg(feature = "gpgme")))]
        pub mod gpgme;

        pub use gpgme::{Gpgme, ensure_ready};
    }
}

pub use bootstrap::Latch;
pub use config::SessionConfig;
pub use error::{
    BootstrapError, ConfigError, EncryptError, EngineError, ImportError, ListError, SessionError,
};
pub use key::KeyRecord;
pub use session::{Buffer, CryptoSession, EncryptResult, ImportOutcome};
