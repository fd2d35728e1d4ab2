use rookdb::LruKReplacer;

#[test]
fn test_evict_prefers_frames_with_short_history() {
    let replacer = LruKReplacer::new(7, 2);

    // Scenario from the textbook: access A B C A B A with A=0, B=1, C=2.
    replacer.record_access(0);
    replacer.record_access(1);
    replacer.record_access(2);
    replacer.record_access(0);
    replacer.record_access(1);
    replacer.record_access(0);

    for f in 0..3 {
        replacer.set_evictable(f, true);
    }
    assert_eq!(replacer.size(), 3);

    // C is the only frame with fewer than 2 accesses.
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.size(), 2);

    // C comes back as a fresh entry, non-evictable until told otherwise;
    // among A and B, B's 2nd-most-recent access is older.
    replacer.record_access(2);
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(0));
    assert_eq!(replacer.evict(), None);
    assert_eq!(replacer.size(), 0);
}

#[test]
fn test_history_frames_evict_fifo() {
    let replacer = LruKReplacer::new(8, 3);
    for f in [4u32, 1, 6, 2] {
        replacer.record_access(f);
        replacer.set_evictable(f, true);
    }
    // None reached 3 accesses; insertion order decides.
    assert_eq!(replacer.evict(), Some(4));
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(6));
    assert_eq!(replacer.evict(), Some(2));
}

#[test]
fn test_non_evictable_frames_are_skipped() {
    let replacer = LruKReplacer::new(4, 2);
    replacer.record_access(0);
    replacer.record_access(1);
    replacer.set_evictable(1, true);

    // Frame 0 is older but pinned.
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), None);

    replacer.set_evictable(0, true);
    assert_eq!(replacer.evict(), Some(0));
}

#[test]
fn test_size_tracks_evictable_count() {
    let replacer = LruKReplacer::new(8, 2);
    for f in 0..5 {
        replacer.record_access(f);
    }
    assert_eq!(replacer.size(), 0);

    for f in 0..5 {
        replacer.set_evictable(f, true);
    }
    assert_eq!(replacer.size(), 5);

    replacer.set_evictable(3, false);
    assert_eq!(replacer.size(), 4);

    replacer.evict();
    assert_eq!(replacer.size(), 3);
}

#[test]
fn test_remove_rejects_pinned_frame() {
    let replacer = LruKReplacer::new(4, 2);
    replacer.record_access(2);
    assert!(replacer.remove(2).is_err());

    replacer.set_evictable(2, true);
    assert!(replacer.remove(2).is_ok());
    assert_eq!(replacer.size(), 0);
}

#[test]
fn test_kth_access_order_decides_cache_eviction() {
    let replacer = LruKReplacer::new(8, 2);

    // Interleave so 2nd-most-recent timestamps are: f0 < f1 < f2.
    replacer.record_access(0); // t1
    replacer.record_access(1); // t2
    replacer.record_access(2); // t3
    replacer.record_access(0); // t4  (f0 history: t1,t4)
    replacer.record_access(1); // t5  (f1 history: t2,t5)
    replacer.record_access(2); // t6  (f2 history: t3,t6)

    for f in 0..3 {
        replacer.set_evictable(f, true);
    }

    assert_eq!(replacer.evict(), Some(0));
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(2));
}
