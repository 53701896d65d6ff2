//! Key Directory Tests
//!
//! One-time pre-key exhaustion and concurrent bundle consumption.

use std::collections::HashSet;
use std::sync::Arc;

use courier_relay::key_directory::{DirectoryError, OneTimePreKeyUpload};

mod common;

fn upload_keys(h: &common::TestHarness, user_id: &str, key_ids: &[u32]) {
    let keys: Vec<OneTimePreKeyUpload> = key_ids
        .iter()
        .map(|&key_id| OneTimePreKeyUpload {
            key_id,
            public_key: "b3RrcHVibGlj".to_string(),
        })
        .collect();
    h.directory.upload_one_time_pre_keys(user_id, &keys).unwrap();
}

/// Two one-time keys serve exactly two bundles; the third bundle has none.
#[test]
fn test_one_time_key_exhaustion() {
    let h = common::harness();
    let carol = common::register_user(&h.store, "carol");
    h.directory
        .upload_signed_pre_key(&carol.user.id, 1, "c2lnbmVkcHJla2V5", "c2ln")
        .unwrap();
    upload_keys(&h, &carol.user.id, &[1, 2]);

    let first = h.directory.bundle(&carol.user.id).unwrap();
    let second = h.directory.bundle(&carol.user.id).unwrap();
    let third = h.directory.bundle(&carol.user.id).unwrap();

    let a = first.one_time_pre_key.expect("first bundle has a key");
    let b = second.one_time_pre_key.expect("second bundle has a key");
    assert_ne!(a.key_id, b.key_id);
    assert!(third.one_time_pre_key.is_none());

    assert_eq!(h.directory.one_time_key_count(&carol.user.id).unwrap(), 0);
}

/// Concurrent fetches never hand out the same one-time key.
#[test]
fn test_concurrent_fetches_get_distinct_keys() {
    let h = common::harness();
    let carol = common::register_user(&h.store, "carol");
    h.directory
        .upload_signed_pre_key(&carol.user.id, 1, "c2lnbmVkcHJla2V5", "c2ln")
        .unwrap();
    upload_keys(&h, &carol.user.id, &(0..16).collect::<Vec<u32>>());

    let directory = Arc::new(h.directory);
    let mut handles = Vec::new();
    for _ in 0..16 {
        let directory = directory.clone();
        let user_id = carol.user.id.clone();
        handles.push(std::thread::spawn(move || {
            directory.bundle(&user_id).unwrap().one_time_pre_key
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let key = handle.join().unwrap().expect("enough keys for everyone");
        assert!(
            seen.insert(key.key_id),
            "key {} handed out twice",
            key.key_id
        );
    }
    assert_eq!(seen.len(), 16);
    assert_eq!(directory.one_time_key_count(&carol.user.id).unwrap(), 0);
}

/// The bundle always carries the newest signed pre-key.
#[test]
fn test_bundle_uses_latest_signed_pre_key() {
    let h = common::harness();
    let carol = common::register_user(&h.store, "carol");

    h.directory
        .upload_signed_pre_key(&carol.user.id, 1, "b2xk", "c2lnMQ==")
        .unwrap();
    h.directory
        .upload_signed_pre_key(&carol.user.id, 2, "bmV3", "c2lnMg==")
        .unwrap();

    let bundle = h.directory.bundle(&carol.user.id).unwrap();
    assert_eq!(bundle.signed_pre_key.key_id, 2);
    assert_eq!(bundle.signed_pre_key.public_key, "bmV3");
    assert_eq!(bundle.identity_public_key, carol.user.identity_public_key);
    assert_eq!(bundle.registration_id, carol.user.registration_id);
}

/// A user without a signed pre-key has no usable bundle.
#[test]
fn test_bundle_requires_signed_pre_key() {
    let h = common::harness();
    let carol = common::register_user(&h.store, "carol");
    upload_keys(&h, &carol.user.id, &[1]);

    assert!(matches!(
        h.directory.bundle(&carol.user.id),
        Err(DirectoryError::NotFound)
    ));

    // The one-time key was not consumed by the failed fetch.
    assert_eq!(h.directory.one_time_key_count(&carol.user.id).unwrap(), 1);
}
