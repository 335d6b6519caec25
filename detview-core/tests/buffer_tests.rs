use detview_core::GrowableBuffer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn test_sequential_pushes_cross_chunks() {
    for n in [0usize, 1, 511, 512, 513, 1024, 5000] {
        let (mut appender, reader) = GrowableBuffer::<i8>::new(512);
        for i in 0..n {
            appender.push((i % 120) as i8).unwrap();
        }

        assert_eq!(reader.len(), n, "n = {n}");
        assert_eq!(appender.len(), n);

        let snapshot = reader.snapshot();
        assert_eq!(snapshot.len(), n);
        for (i, &value) in snapshot.iter().enumerate() {
            assert_eq!(value, (i % 120) as i8, "mismatch at {i} for n = {n}");
        }
        assert_eq!(reader.capacity() % 512, 0);
    }
}

#[test]
fn test_indexed_reads() {
    let (mut appender, reader) = GrowableBuffer::<u32>::new(16);
    for i in 0..100 {
        appender.push(i * 3).unwrap();
    }
    assert_eq!(reader.get(0), Some(0));
    assert_eq!(reader.get(99), Some(297));
    assert_eq!(reader.get(100), None);
}

#[test]
fn test_reader_handles_share_contents() {
    let (mut appender, reader) = GrowableBuffer::<i8>::new(8);
    let second = reader.clone();
    let third = appender.reader();

    appender.push(5).unwrap();
    assert_eq!(reader.snapshot(), vec![5]);
    assert_eq!(second.snapshot(), vec![5]);
    assert_eq!(third.snapshot(), vec![5]);
}

#[test]
fn test_explicit_reserve_avoids_relocation() {
    let (mut appender, reader) = GrowableBuffer::<i8>::new(512);
    appender.reserve(2000).unwrap();
    let capacity = reader.capacity();
    assert_eq!(capacity, 2048);

    for _ in 0..2000 {
        appender.push(1).unwrap();
    }
    assert_eq!(reader.capacity(), capacity);
}

#[test]
fn test_snapshots_during_appends_are_prefixes() {
    const TOTAL: usize = 200_000;

    // Small chunk forces many relocations while readers copy
    let (mut appender, reader) = GrowableBuffer::<u32>::new(64);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let reader = reader.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last_len = 0;
                while !done.load(Ordering::Acquire) {
                    let len_before = reader.len();
                    let snapshot = reader.snapshot();

                    assert!(snapshot.len() >= len_before, "snapshot lost published elements");
                    assert!(snapshot.len() >= last_len, "length went backwards");
                    for (i, &value) in snapshot.iter().enumerate() {
                        assert_eq!(value, i as u32, "torn value at {i}");
                    }
                    last_len = snapshot.len();
                }
            })
        })
        .collect();

    for i in 0..TOTAL {
        appender.push(i as u32).unwrap();
    }
    done.store(true, Ordering::Release);

    for handle in readers {
        handle.join().unwrap();
    }
    assert_eq!(reader.len(), TOTAL);
    assert_eq!(reader.snapshot().last(), Some(&(TOTAL as u32 - 1)));
}
