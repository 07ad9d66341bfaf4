// Lifecycle tests over an in-memory store: init, open, passwd, resize,
// delete, and the failure modes a careless operator will hit first.

use block_codec::{Codec, Compressor};
use cloud_store::{MemStore, ObjectStore};
use stratus_core::config::VolumeConfig;
use stratus_core::keys::{derive_pass_key, DataKey};
use volume::{InitOptions, OpenOptions, VolumeError};

const BS: u32 = 4096;
const SIZE: u64 = 1 << 20;

fn store() -> MemStore {
    MemStore::new()
}

fn boxed(store: &MemStore) -> Box<dyn ObjectStore> {
    Box::new(store.clone())
}

fn inspect(store: &MemStore) -> MemStore {
    let mut handle = store.clone();
    handle.check_access().unwrap();
    handle
}

fn quick_open(store: &MemStore, name: &str, passphrase: &str) -> Result<volume::Volume, VolumeError> {
    volume::open(
        boxed(store),
        name,
        passphrase,
        OpenOptions { threads: 2, read_ahead: 0, ..OpenOptions::default() },
    )
}

#[test]
fn init_creates_an_encrypted_config_object() {
    let s = store();
    volume::init(boxed(&s), "ops/init", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    let raw = inspect(&s).get("config").unwrap().expect("config object must exist");
    // ciphertext, not JSON
    assert_ne!(raw.content().first(), Some(&b'{'));
    let codec = Codec::new(derive_pass_key("pw"), None, Compressor::Plain);
    let plain = codec.decrypt("config", raw.content()).unwrap();
    let config = VolumeConfig::from_json(&plain).unwrap();
    assert_eq!(config.size, SIZE);
    assert_eq!(config.bs, BS);
    assert!(config.requires.contains("compress-deflate"));
    assert!(config.data_key().is_ok());
}

#[test]
fn double_init_is_refused() {
    let s = store();
    volume::init(boxed(&s), "ops/double", "pw", InitOptions::with_size(SIZE)).unwrap();
    let err = volume::init(boxed(&s), "ops/double", "pw", InitOptions::with_size(SIZE))
        .err()
        .expect("second init must fail");
    assert!(matches!(err, VolumeError::AlreadyExists(_)));
    // even with a different passphrase
    let err = volume::init(boxed(&s), "ops/double", "other", InitOptions::with_size(SIZE))
        .err()
        .expect("init under any passphrase must fail");
    assert!(matches!(err, VolumeError::AlreadyExists(_)));
}

#[test]
fn open_with_wrong_passphrase_fails_before_serving() {
    let s = store();
    volume::init(boxed(&s), "ops/wrongpw", "correct", InitOptions { size: SIZE, bs: BS }).unwrap();
    let err = quick_open(&s, "ops/wrongpw", "incorrect").err().expect("open must fail");
    assert!(matches!(err, VolumeError::WrongPassphrase));
}

#[test]
fn open_missing_volume_reports_no_such_volume() {
    let s = store();
    let err = quick_open(&s, "ops/missing", "pw").err().expect("open must fail");
    assert!(matches!(err, VolumeError::NoSuchVolume(_)));
}

#[test]
fn open_write_reopen_sees_the_data() {
    let s = store();
    volume::init(boxed(&s), "ops/rw", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    {
        let vol = quick_open(&s, "ops/rw", "pw").unwrap();
        assert_eq!(vol.size(), SIZE);
        let mapper = vol.mapper();
        mapper.write(100, b"persisted").unwrap();
        vol.flush();
        vol.close();
    }
    let vol = quick_open(&s, "ops/rw", "pw").unwrap();
    assert_eq!(vol.mapper().read(100, 9).unwrap(), b"persisted");
}

#[test]
fn second_open_of_the_same_volume_is_refused() {
    let s = store();
    volume::init(boxed(&s), "ops/locked", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    let _vol = quick_open(&s, "ops/locked", "pw").unwrap();
    let err = quick_open(&s, "ops/locked", "pw").err().expect("second open must fail");
    assert!(matches!(err, VolumeError::AlreadyOpen(_)));
}

#[test]
fn passwd_rewraps_the_config() {
    let s = store();
    volume::init(boxed(&s), "ops/passwd", "old-pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    {
        let vol = quick_open(&s, "ops/passwd", "old-pw").unwrap();
        vol.mapper().write(0, b"survives the rewrap").unwrap();
        vol.flush();
    }
    volume::passwd(boxed(&s), "ops/passwd", "old-pw", "new-pw").unwrap();
    assert!(matches!(
        quick_open(&s, "ops/passwd", "old-pw").err().expect("old passphrase must fail"),
        VolumeError::WrongPassphrase
    ));
    let vol = quick_open(&s, "ops/passwd", "new-pw").unwrap();
    // block data was encrypted with the unchanged data key
    assert_eq!(vol.mapper().read(0, 19).unwrap(), b"survives the rewrap");
}

#[test]
fn info_reports_size_and_block_size() {
    let s = store();
    volume::init(boxed(&s), "ops/info", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    let info = volume::info(boxed(&s), "ops/info", "pw").unwrap();
    assert_eq!(info.size, SIZE);
    assert_eq!(info.bs, BS);
    assert_eq!(info.requires, vec!["compress-deflate".to_string()]);
}

#[test]
fn resize_updates_config_and_cleanup_trims_tail_objects() {
    let s = store();
    volume::init(boxed(&s), "ops/resize", "pw", InitOptions { size: 10 * u64::from(BS), bs: BS })
        .unwrap();
    {
        let vol = quick_open(&s, "ops/resize", "pw").unwrap();
        let mapper = vol.mapper();
        for i in 0..10u64 {
            mapper.write(i * u64::from(BS), &[0x40 + i as u8; 16]).unwrap();
        }
        vol.flush();
    }
    assert_eq!(inspect(&s).list("blocks/").unwrap().count(), 10);

    let report =
        volume::resize(boxed(&s), "ops/resize", "pw", Some(2 * u64::from(BS)), true, 4).unwrap();
    assert_eq!(report.size, 2 * u64::from(BS));
    // blocks 0..=3 survive (one conservative trailing block), 4..=9 are gone
    assert_eq!(report.deleted_objects, 6);
    let remaining: Vec<String> = inspect(&s).list("blocks/").unwrap().collect();
    let expected: Vec<String> =
        ["blocks/0", "blocks/1", "blocks/2", "blocks/3"].iter().map(|s| (*s).into()).collect();
    assert_eq!(remaining, expected);

    let info = volume::info(boxed(&s), "ops/resize", "pw").unwrap();
    assert_eq!(info.size, 2 * u64::from(BS));
}

#[test]
fn delete_removes_blocks_then_config() {
    let s = store();
    volume::init(boxed(&s), "ops/delete", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    {
        let vol = quick_open(&s, "ops/delete", "pw").unwrap();
        vol.mapper().write(0, &[1u8; 64]).unwrap();
        vol.mapper().write(u64::from(BS) * 3, &[2u8; 64]).unwrap();
        vol.flush();
    }
    let deleted = volume::delete(boxed(&s), "ops/delete", "pw", 4).unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(inspect(&s).object_count(), 0);
    assert!(matches!(
        quick_open(&s, "ops/delete", "pw").err().expect("volume is gone"),
        VolumeError::NoSuchVolume(_)
    ));
}

#[test]
fn delete_with_wrong_passphrase_changes_nothing() {
    let s = store();
    volume::init(boxed(&s), "ops/delguard", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    let err = volume::delete(boxed(&s), "ops/delguard", "nope", 2).err().expect("must fail");
    assert!(matches!(err, VolumeError::WrongPassphrase));
    assert!(inspect(&s).get("config").unwrap().is_some());
}

fn put_config(store: &MemStore, passphrase: &str, config: &VolumeConfig) {
    let codec = Codec::new(derive_pass_key(passphrase), None, Compressor::Plain);
    let ciphertext = codec.encrypt("config", &config.to_json().unwrap()).unwrap();
    inspect(store).put("config", &ciphertext).unwrap();
}

#[test]
fn volume_marked_deleted_cannot_be_opened() {
    let s = store();
    let mut config = VolumeConfig::new(SIZE, BS, &DataKey::generate());
    config.deleted = Some(true);
    put_config(&s, "pw", &config);
    let err = quick_open(&s, "ops/marked", "pw").err().expect("open must fail");
    assert!(matches!(err, VolumeError::Deleted(_)));
}

#[test]
fn unknown_required_capability_blocks_open() {
    let s = store();
    let mut config = VolumeConfig::new(SIZE, BS, &DataKey::generate());
    config.requires.insert("compress-zstd".into());
    put_config(&s, "pw", &config);
    let err = quick_open(&s, "ops/caps", "pw").err().expect("open must fail");
    match err {
        VolumeError::Unsupported(tags) => assert_eq!(tags, vec!["compress-zstd".to_string()]),
        other => panic!("expected Unsupported, got {other:?}"),
    }
}

#[test]
fn size_override_is_advertised_instead_of_config_size() {
    let s = store();
    volume::init(boxed(&s), "ops/override", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    let vol = volume::open(
        boxed(&s),
        "ops/override",
        "pw",
        OpenOptions { threads: 1, read_ahead: 0, size_override: Some(SIZE / 2), ..OpenOptions::default() },
    )
    .unwrap();
    assert_eq!(vol.size(), SIZE / 2);
    assert_eq!(vol.config().size, SIZE);
}
