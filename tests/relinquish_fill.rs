use bp_mpool::store::{StoreAttrs, StoreManager, WaitTimeout};

#[test]
fn relinquishing_every_slot_in_a_bucket_deletes_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::new(1);
    let attrs = StoreAttrs {
        root_path: Some(dir.path().to_path_buf()),
        cache_size: 16,
        flush_on_write: true,
    };
    let handle = mgr.create(attrs).unwrap();
    let store = mgr.get(handle).unwrap();

    let mut sids = Vec::new();
    for _ in 0..256 {
        sids.push(store.enqueue(b"x", b"", WaitTimeout::Poll).unwrap());
    }
    assert_eq!(store.getcount(), 256);

    let dat_path = dir.path().join("0_0.dat");
    assert!(dat_path.is_file());

    for (n, sid) in sids.into_iter().enumerate() {
        store.relinquish(sid).unwrap();
        if n + 1 < 256 {
            assert!(dat_path.is_file(), "bucket deleted before the last relinquish");
        }
    }

    assert_eq!(store.getcount(), 0);
    assert!(!dat_path.is_file());
    assert!(!dir.path().join("0_0.tbl").is_file());
}
