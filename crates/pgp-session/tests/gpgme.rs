//! Tests against a real GPGME installation.

#![cfg(feature = "gpgme")]
#![allow(clippy::expect_used, clippy::indexing_slicing)]

use std::{
    fs,
    io::Write as _,
    path::Path,
    process::{Command, Stdio},
};

use pgp_session::{
    ConfigError, CryptoSession, EncryptError, ImportOutcome, SessionConfig, SessionError,
};
use tempfile::TempDir;

const ALICE_FPR: &str = "A64E809A524210FEDB60125260354C83F789A9E5";
const BOB_FPR: &str = "BAA6CC84106A8B37689396BB862EBD15B6C99F75";
const ALICE_PUB: &str = include_str!("data/alice.pub.asc");
const ALICE_SEC: &str = include_str!("data/alice.sec.asc");
const BOB_PUB: &str = include_str!("data/bob.pub.asc");

fn keyring() -> TempDir {
    tempfile::tempdir().expect("should be able to create temp dir")
}

fn session(dir: &Path) -> CryptoSession<pgp_session::Gpgme> {
    CryptoSession::new(SessionConfig::new(dir)).expect("should be able to create session")
}

/// Runs `gpg` against the keyring at `home`, feeding it `stdin`.
fn gpg(home: &Path, args: &[&str], stdin: &[u8]) -> Vec<u8> {
    let mut child = Command::new("gpg")
        .arg("--homedir")
        .arg(home)
        .args(["--batch", "--yes", "--pinentry-mode", "loopback"])
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("should be able to run gpg");
    child
        .stdin
        .take()
        .expect("stdin should be piped")
        .write_all(stdin)
        .expect("should be able to write to gpg");
    let out = child.wait_with_output().expect("gpg should exit");
    assert!(
        out.status.success(),
        "gpg {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    out.stdout
}

#[test_log::test]
fn test_bootstrap() {
    pgp_session::ensure_ready().expect("bootstrap should succeed");
    pgp_session::ensure_ready().expect("bootstrap should be repeatable");
}

#[test_log::test]
fn test_engine_info() {
    let dir = keyring();
    let s = session(dir.path());
    let info = s.engine_info().expect("engine info should be available");
    assert!(!info.version.is_empty());
    assert!(info.file_name.is_absolute(), "{:?}", info.file_name);
    assert_eq!(s.version(), Some(info.version));
}

#[test_log::test]
fn test_import_single_key() {
    let dir = keyring();
    let mut s = session(dir.path());
    let got = s
        .import_key(ALICE_PUB.as_bytes())
        .expect("import should succeed");
    assert_eq!(
        got,
        ImportOutcome::Imported {
            fingerprint: ALICE_FPR.into()
        }
    );
}

#[test_log::test]
fn test_import_two_keys() {
    let dir = keyring();
    let mut s = session(dir.path());
    let both = format!("{ALICE_PUB}\n{BOB_PUB}");
    let got = s
        .import_key(both.as_bytes())
        .expect("import should not fail");
    assert_eq!(got, ImportOutcome::NotFound { considered: 2 });
}

#[test_log::test]
fn test_import_garbage() {
    let dir = keyring();
    let mut s = session(dir.path());
    // GPGME reports garbage either as nothing considered or as a
    // failed operation.
    match s.import_key(b"this is not a key") {
        Ok(got) => assert_eq!(got, ImportOutcome::NotFound { considered: 0 }),
        Err(err) => assert!(matches!(err, pgp_session::ImportError::EngineFailure(_))),
    }
}

#[test_log::test]
fn test_list_keys() {
    let dir = keyring();
    let mut s = session(dir.path());
    assert!(s.list_keys().expect("listing should succeed").is_empty());

    s.import_key(ALICE_PUB.as_bytes())
        .expect("import should succeed");
    let keys = s.list_keys().expect("listing should succeed");
    assert_eq!(keys.len(), 1);
    let alice = &keys[0];
    assert_eq!(alice.fingerprint.as_deref(), Some(ALICE_FPR));
    assert_eq!(alice.email.as_deref(), Some("alice@example.org"));
    assert_eq!(alice.name.as_deref(), Some("Alice Example"));
    assert!(!alice.revoked);
    assert!(!alice.expired);
    assert!(alice.can_encrypt);
    assert!(alice.is_usable_recipient());
}

#[test_log::test]
fn test_encrypt_round_trip() {
    let dir = keyring();
    gpg(dir.path(), &["--import"], ALICE_SEC.as_bytes());

    let mut s = session(dir.path());
    const MSG: &str = "attack at dawn";
    let got = s.encrypt(ALICE_FPR, MSG).expect("encrypt should succeed");
    assert!(got.starts_with(b"-----BEGIN PGP MESSAGE-----"));

    let plain = gpg(dir.path(), &["--decrypt"], &got);
    assert_eq!(plain, MSG.as_bytes());
}

#[test_log::test]
fn test_encrypt_binary() {
    let dir = keyring();
    gpg(dir.path(), &["--import"], ALICE_SEC.as_bytes());

    let mut s = CryptoSession::new(SessionConfig::new(dir.path()).with_armored(false))
        .expect("should be able to create session");
    let got = s
        .encrypt_bytes(ALICE_FPR, b"\x00\x01\x02")
        .expect("encrypt should succeed");
    assert!(!got.starts_with(b"-----BEGIN"));

    let plain = gpg(dir.path(), &["--decrypt"], &got);
    assert_eq!(plain, b"\x00\x01\x02");
}

#[test_log::test]
fn test_encrypt_unknown_recipient() {
    let dir = keyring();
    let mut s = session(dir.path());
    for fpr in [BOB_FPR, ""] {
        let err = s.encrypt(fpr, "hello").expect_err("encrypt should fail");
        assert!(
            matches!(err, EncryptError::UnknownRecipient(ref got) if got == fpr),
            "{err:?}"
        );
    }
}

#[test_log::test]
fn test_keyring_is_a_file() {
    let dir = keyring();
    let file = dir.path().join("keys");
    fs::write(&file, b"").expect("should be able to write file");
    let err = CryptoSession::new(SessionConfig::new(&file)).expect_err("construction should fail");
    assert!(
        matches!(
            err,
            SessionError::EngineConfigFailed {
                source: ConfigError::NotADirectory,
                ..
            }
        ),
        "{err:?}"
    );
}

#[test_log::test]
fn test_concurrent_sessions() {
    let dir = keyring();
    session(dir.path())
        .import_key(ALICE_PUB.as_bytes())
        .expect("import should succeed");

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let keys = session(dir.path())
                    .list_keys()
                    .expect("listing should succeed");
                assert_eq!(keys.len(), 1);
                assert_eq!(keys[0].fingerprint.as_deref(), Some(ALICE_FPR));
            });
        }
    });
}
