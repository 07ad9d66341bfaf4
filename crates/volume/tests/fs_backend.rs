// The same lifecycle over the directory backend, reached through the
// backend factory the way an embedding program would.

use cloud_store::{open_backend, ObjectStore};
use volume::{InitOptions, OpenOptions, VolumeError};

const BS: u32 = 4096;
const SIZE: u64 = 256 * 1024;

fn backend(root: &std::path::Path) -> Box<dyn ObjectStore> {
    open_backend("fs", root.to_str().unwrap()).unwrap()
}

#[test]
fn full_lifecycle_on_the_fs_backend() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    volume::init(backend(root), "fs/lifecycle", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    assert!(root.join("config").is_file());

    {
        let vol = volume::open(
            backend(root),
            "fs/lifecycle",
            "pw",
            OpenOptions { threads: 2, read_ahead: 0, ..OpenOptions::default() },
        )
        .unwrap();
        let mapper = vol.mapper();
        mapper.write(5000, b"on real files").unwrap();
        vol.flush();
        // block 1 covers offset 5000 with bs 4096
        assert!(root.join("blocks").join("1").is_file());
        vol.close();
    }

    let vol = volume::open(
        backend(root),
        "fs/lifecycle",
        "pw",
        OpenOptions { threads: 1, read_ahead: 0, ..OpenOptions::default() },
    )
    .unwrap();
    assert_eq!(vol.mapper().read(5000, 13).unwrap(), b"on real files");
    vol.close();
    drop(vol);

    volume::delete(backend(root), "fs/lifecycle", "pw", 2).unwrap();
    assert!(!root.join("config").exists());
    assert!(!root.join("blocks").join("1").exists());
}

#[test]
fn stored_files_are_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    volume::init(backend(root), "fs/opaque", "pw", InitOptions { size: SIZE, bs: BS }).unwrap();
    let vol = volume::open(
        backend(root),
        "fs/opaque",
        "pw",
        OpenOptions { threads: 1, read_ahead: 0, ..OpenOptions::default() },
    )
    .unwrap();
    vol.mapper().write(0, b"plaintext marker zzqy").unwrap();
    vol.flush();
    vol.close();
    let raw = std::fs::read(root.join("blocks").join("0")).unwrap();
    assert_eq!(raw.len() % 32, 0);
    assert!(
        !raw.windows(21).any(|w| w == b"plaintext marker zzqy"),
        "payload must not appear in the stored object"
    );
}

#[test]
fn missing_root_directory_fails_access_check() {
    let dir = tempfile::tempdir().unwrap();
    let gone = dir.path().join("never-created");
    let err = volume::init(
        open_backend("fs", gone.to_str().unwrap()).unwrap(),
        "fs/missing",
        "pw",
        InitOptions::with_size(SIZE),
    )
    .err()
    .expect("init must fail");
    assert!(matches!(err, VolumeError::Store(cloud_store::StoreError::NoSuchBucket(_))));
}
