use bp_mpool::store::{StoreAttrs, StoreManager, WaitTimeout};

#[test]
fn enqueueing_257_records_opens_a_second_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = StoreManager::new(1);
    let attrs = StoreAttrs {
        root_path: Some(dir.path().to_path_buf()),
        cache_size: 16,
        flush_on_write: true,
    };
    let handle = mgr.create(attrs).unwrap();
    let store = mgr.get(handle).unwrap();

    for _ in 0..257 {
        store.enqueue(b"a", b"", WaitTimeout::Poll).unwrap();
    }
    assert_eq!(store.getcount(), 257);

    // service id 0 is the manager's first-issued id.
    let bucket0 = dir.path().join("0_0.dat");
    let bucket1 = dir.path().join("0_1.dat");
    assert!(bucket0.is_file());
    assert!(bucket1.is_file());

    // size(u32) + ObjectHeader{handle:i32, sid:u64, size:u32} + 1 payload byte.
    let record_len = std::mem::size_of::<u32>()
        + std::mem::size_of::<i32>()
        + std::mem::size_of::<u64>()
        + std::mem::size_of::<u32>()
        + 1;
    assert_eq!(std::fs::metadata(&bucket0).unwrap().len() as usize, record_len * 256);
    assert_eq!(std::fs::metadata(&bucket1).unwrap().len() as usize, record_len);
}
