//! 块缓存的多线程行为

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use xv6_kmem::consts::fs::BSIZE;
use xv6_kmem::{Bcache, BcacheConfig, RamDisk};

fn cache(nbuf: usize, nbucket: usize) -> (Arc<RamDisk>, Bcache) {
    let disk = Arc::new(RamDisk::new(128));
    let cache = Bcache::new(BcacheConfig { nbuf, nbucket }, disk.clone());
    (disk, cache)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn default_geometry() {
    let (_, cache) = cache(30, 13);
    assert_eq!(BcacheConfig::default(), BcacheConfig { nbuf: 30, nbucket: 13 });
    assert_eq!(cache.nbuf(), 30);
    assert_eq!(BSIZE, 1024);
}

#[test]
fn second_reader_waits_on_the_same_buffer() {
    let (disk, cache) = cache(4, 2);
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let cache = &cache;
        let first = s.spawn(move || {
            let mut b = cache.bread(1, 7);
            b.data_mut()[0] = 42;
            held_tx.send(b.index()).unwrap();
            release_rx.recv().unwrap();
            b.index()
        });
        let index = held_rx.recv().unwrap();

        let second = s.spawn(move || {
            let b = cache.bread(1, 7);
            (b.index(), b.data()[0])
        });

        // 第二个线程已经拿到引用，正在等待睡眠锁
        wait_until(|| cache.stat(1, 7).map(|st| st.refcnt) == Some(2));
        release_tx.send(()).unwrap();

        assert_eq!(first.join().unwrap(), index);
        assert_eq!(second.join().unwrap(), (index, 42));
    });

    assert_eq!(disk.reads(), 1);
    assert_eq!(cache.stat(1, 7).unwrap().refcnt, 0);
}

#[test]
fn simultaneous_misses_share_one_buffer() {
    for _ in 0..50 {
        let (disk, cache) = cache(4, 2);
        let barrier = Barrier::new(2);
        let indices: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        cache.bread(1, 7).index()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(indices[0], indices[1]);
        assert_eq!(disk.reads(), 1);
        let copies = cache
            .stats()
            .iter()
            .filter(|st| (st.dev, st.blockno) == (1, 7))
            .count();
        assert_eq!(copies, 1);
    }
}

#[test]
fn concurrent_read_modify_write_is_exact() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;
    const BLOCKS: u32 = 8;

    // 缓冲块比块少，迫使读写过程中不断淘汰
    let (disk, cache) = cache(THREADS, 3);
    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            s.spawn(move || {
                for i in 0..ROUNDS {
                    let blockno = ((i * 7 + t) % BLOCKS as usize) as u32;
                    let mut b = cache.bread(0, blockno);
                    let mut count = [0u8; 4];
                    count.copy_from_slice(&b.data()[..4]);
                    let count = u32::from_le_bytes(count) + 1;
                    b.data_mut()[..4].copy_from_slice(&count.to_le_bytes());
                    b.bwrite();
                    b.brelse();
                }
            });
        }
    });

    let total: u32 = (0..BLOCKS)
        .map(|blockno| {
            let block = disk.peek(0, blockno);
            u32::from_le_bytes([block[0], block[1], block[2], block[3]])
        })
        .sum();
    assert_eq!(total as usize, THREADS * ROUNDS);
    assert_eq!(disk.writes(), THREADS * ROUNDS);
    assert!(cache.stats().iter().all(|st| st.refcnt == 0));

    // 同一身份至多一个缓冲块
    let mut ids: Vec<_> = cache
        .stats()
        .iter()
        .filter(|st| st.valid)
        .map(|st| (st.dev, st.blockno))
        .collect();
    let n = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), n);
}

#[test]
fn buffer_moved_to_another_thread_cannot_be_released() {
    let (_, cache) = cache(2, 2);
    let b = cache.bread(0, 3);
    let index = b.index();
    let res = thread::scope(|s| s.spawn(move || drop(b)).join());
    assert!(res.is_err());

    // 原持有者的引用与睡眠锁都没有被释放
    let st = cache.stat(0, 3).unwrap();
    assert_eq!((st.index, st.refcnt), (index, 1));
}
