#![allow(clippy::expect_used)]

use std::thread;

use pgp_session::{
    CryptoSession, KeyRecord, SessionConfig,
    testing::{FakeEngine, FakeKey},
};

fn fingerprints(keys: &[KeyRecord]) -> Vec<&str> {
    let mut fprs = keys
        .iter()
        .filter_map(|k| k.fingerprint.as_deref())
        .collect::<Vec<_>>();
    fprs.sort_unstable();
    fprs
}

#[test_log::test]
fn test_sessions_share_a_keyring() {
    let dir = tempfile::tempdir().expect("should be able to create temp dir");
    let eng = FakeEngine::new();

    let mut writer = CryptoSession::with_engine(eng.clone(), SessionConfig::new(dir.path()))
        .expect("should be able to create session");
    for fpr in ["AAAA", "BBBB"] {
        writer
            .import_key(&FakeKey::new(fpr).export())
            .expect("import should succeed");
    }

    let readers = (0..2)
        .map(|_| {
            CryptoSession::with_engine(eng.clone(), SessionConfig::new(dir.path()))
                .expect("should be able to create session")
        })
        .collect::<Vec<_>>();

    let listed = thread::scope(|s| {
        let handles = readers
            .into_iter()
            .map(|mut session| s.spawn(move || session.list_keys()))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread should not panic"))
            .collect::<Vec<_>>()
    });
    for keys in listed {
        let keys = keys.expect("listing should succeed");
        assert_eq!(fingerprints(&keys), ["AAAA", "BBBB"]);
    }

    drop(writer);
    let stats = eng.stats();
    assert_eq!(stats.live_contexts, 0);
    assert_eq!(stats.released_contexts, 3);
    assert_eq!(stats.live_keys, 0);
    assert!(!stats.listing_active);
}

#[test_log::test]
fn test_sessions_on_different_keyrings_are_isolated() {
    let a = tempfile::tempdir().expect("should be able to create temp dir");
    let b = tempfile::tempdir().expect("should be able to create temp dir");
    let eng = FakeEngine::new();

    let mut sa = CryptoSession::with_engine(eng.clone(), SessionConfig::new(a.path()))
        .expect("should be able to create session");
    let mut sb = CryptoSession::with_engine(eng.clone(), SessionConfig::new(b.path()))
        .expect("should be able to create session");

    let key = FakeKey::new("A64E809A524210FEDB60125260354C83F789A9E5")
        .with_uid("Alice Example", "alice@example.org")
        .with_secret();
    sa.import_key(&key.export()).expect("import should succeed");

    assert_eq!(sa.list_keys().expect("listing should succeed").len(), 1);
    assert!(sb.list_keys().expect("listing should succeed").is_empty());

    sb.encrypt(&key.fingerprint, "hello")
        .expect_err("the other keyring does not have the key");

    let ciphertext = sa
        .encrypt(&key.fingerprint, "hello")
        .expect("encrypt should succeed");
    assert_eq!(
        eng.decrypt(a.path(), &ciphertext).as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(eng.decrypt(b.path(), &ciphertext), None);
}

#[test_log::test]
fn test_session_moves_between_threads() {
    let dir = tempfile::tempdir().expect("should be able to create temp dir");
    let eng = FakeEngine::new();
    let mut s = CryptoSession::with_engine(eng.clone(), SessionConfig::new(dir.path()))
        .expect("should be able to create session");
    s.import_key(&FakeKey::new("CAFE").with_secret().export())
        .expect("import should succeed");

    let ciphertext = thread::spawn(move || {
        s.encrypt("CAFE", "over there")
            .expect("encrypt should succeed")
            .into_inner()
    })
    .join()
    .expect("thread should not panic");

    assert_eq!(
        eng.decrypt(dir.path(), ciphertext.as_ref()).as_deref(),
        Some(&b"over there"[..])
    );
    drop(ciphertext);
    let stats = eng.stats();
    assert_eq!(stats.live_contexts, 0);
    assert_eq!(stats.live_buffers, 0);
}
