//! 缓存层
//!
//! 块缓存由固定数量的缓冲块组成，缓存磁盘块的内容以减少磁盘读取，
//! 同时为多个线程共同使用的磁盘块提供同步点。
//!
//! 接口：
//! * 通过 [`Bcache::bread`] 取得某个磁盘块对应的、已上锁的缓冲块；
//! * 修改数据后调用 [`Buf::bwrite`] 写回磁盘；
//! * 用完后调用 [`Buf::brelse`]，或直接丢弃 [`Buf`]；
//! * 同一时刻只有一个线程能使用某个缓冲块，不要长时间持有。

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::{info, trace};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 块缓存的规模配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcacheConfig {
    /// 缓冲块数量
    pub nbuf: usize,
    /// 哈希桶（桶锁）数量
    pub nbucket: usize,
}

impl Default for BcacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nbucket: NBUCKET,
        }
    }
}

/// 缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的缓冲块池。每个缓冲块的引用计数和
/// 最近使用时间戳由其块号所在哈希桶的自旋锁保护；未命中时挑选牺牲块
/// 并装入新身份的整个过程由一把全局锁串行化。
///
/// LRU 顺序完全由时间戳表示：每次获取或释放缓冲块都从同一个单调递增的
/// 计数器取一个新值，淘汰时选择引用计数为 0 且时间戳最小的缓冲块。
pub struct Bcache {
    /// 串行化未命中路径：挑选牺牲块并装入新身份
    lock: SpinLock<()>,

    /// 哈希桶锁，缓冲块 `b` 的桶为 `b.blockno % nbucket`
    buckets: Box<[SpinLock<()>]>,

    /// 缓冲块数组，构造后数量不再改变
    bufs: Box<[BufInner]>,

    /// 全局时间戳计数器
    ticks: AtomicU64,

    /// 磁盘
    disk: Arc<dyn BlockDevice>,
}

impl Bcache {
    /// 构造块缓存。
    ///
    /// # 流程解释
    /// - 建立全局锁与 `nbucket` 把桶锁；
    /// - 建立 `nbuf` 个缓冲块及其睡眠锁；
    /// - 按数组顺序从计数器为每个缓冲块取一个初始时间戳，
    ///   因此从未用过的缓冲块按下标顺序被优先淘汰。
    ///
    /// # 可能的错误
    /// `nbuf` 或 `nbucket` 为 0 时触发 panic。
    pub fn new(config: BcacheConfig, disk: Arc<dyn BlockDevice>) -> Self {
        if config.nbuf == 0 || config.nbucket == 0 {
            panic!("binit: empty cache {:?}", config);
        }

        let ticks = AtomicU64::new(0);
        let bufs = (0..config.nbuf)
            .map(|_| BufInner::new(ticks.fetch_add(1, Ordering::Relaxed)))
            .collect();
        let buckets = (0..config.nbucket)
            .map(|_| SpinLock::new((), "bcache.bucket"))
            .collect();

        info!(
            "binit: {} buffers of {} bytes, {} buckets",
            config.nbuf, BSIZE, config.nbucket
        );
        #[cfg(feature = "verbose_init_info")]
        info!(
            "binit: BufData size {} align {}",
            std::mem::size_of::<BufData>(),
            std::mem::align_of::<BufData>()
        );

        Self {
            lock: SpinLock::new((), "bcache"),
            buckets,
            bufs,
            ticks,
            disk,
        }
    }

    /// 获取指定设备与块号对应的缓冲块，返回时已持有其睡眠锁。
    ///
    /// # 流程解释
    /// 快速路径：
    /// - 不加锁扫描缓冲块数组查找 `(dev, blockno)`；
    /// - 找到后在该块号的桶锁下复查（扫描与加锁之间它可能已被淘汰）；
    /// - 复查通过则增加引用计数、更新时间戳，释放桶锁后等待睡眠锁。
    ///
    /// 慢速路径（全局锁下）：
    /// - 再扫描一次，其他线程可能已经装入了这个块；
    /// - 仍未命中则挑选引用计数为 0、时间戳最小的缓冲块作为牺牲块，
    ///   锁住新旧两个身份的桶锁后复查其引用计数，已被别人引用则重新挑选；
    /// - 装入新身份：`valid = false`，`refcnt = 1`，新时间戳。
    ///
    /// 该函数不读磁盘，调用者根据 `valid` 决定是否需要加载数据。
    ///
    /// # 可能的错误
    /// 所有缓冲块都被引用时无法淘汰，触发 panic（`"bget: no buffers"`）。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = make_key(dev, blockno);
        let num = self.bucket(blockno);

        // 块是否已经在缓存中
        if let Some(index) = self.find(key) {
            let bucket = self.buckets[num].lock();
            // 扫描之后它可能已被替换，重新检查
            if self.bufs[index].key.load(Ordering::Acquire) == key {
                self.claim(index);
                drop(bucket);
                trace!("bget: hit ({}, {}) in buf {}", dev, blockno, index);
                return self.buf(index, dev, blockno);
            }
            drop(bucket);
        }

        let ctrl = self.lock.lock();

        // 其他线程可能在两个阶段之间已经装入了这个块
        if let Some(index) = self.find(key) {
            let bucket = self.buckets[num].lock();
            self.claim(index);
            drop(bucket);
            drop(ctrl);
            trace!("bget: late hit ({}, {}) in buf {}", dev, blockno, index);
            return self.buf(index, dev, blockno);
        }

        loop {
            let index = match self.lru_victim() {
                Some(index) => index,
                None => panic!("bget: no buffers"),
            };
            let victim = &self.bufs[index];
            let (old_dev, old_blockno) = split_key(victim.key.load(Ordering::Acquire));

            let buckets = self.lock_pair(self.bucket(old_blockno), num);
            if victim.refcnt.load(Ordering::Relaxed) != 0 {
                // 快速路径上的其他线程抢先引用了它
                drop(buckets);
                continue;
            }
            victim.key.store(key, Ordering::Release);
            victim.valid.store(false, Ordering::Release);
            victim.refcnt.store(1, Ordering::Relaxed);
            victim.ticks.store(self.tick(), Ordering::Relaxed);
            drop(buckets);
            drop(ctrl);

            trace!(
                "bget: evict buf {} ({}, {}) for ({}, {})",
                index,
                old_dev,
                old_blockno,
                dev,
                blockno
            );
            return self.buf(index, dev, blockno);
        }
    }

    /// 返回一个持有指定块有效内容的缓冲块。
    ///
    /// 若缓冲块尚未从磁盘加载（`valid` 为 false），同步读取一次并标记为有效。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !b.valid() {
            self.disk.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Release);
        }
        b
    }

    /// 缓冲块数量
    pub fn nbuf(&self) -> usize {
        self.bufs.len()
    }

    /// 查看当前持有 `(dev, blockno)` 身份的缓冲块的元信息。
    ///
    /// 读取不加锁，只适合调试与测试观察。
    pub fn stat(&self, dev: u32, blockno: u32) -> Option<BufStat> {
        self.find(make_key(dev, blockno))
            .map(|index| self.bufs[index].stat(index))
    }

    /// 所有缓冲块元信息的快照，按下标排列
    pub fn stats(&self) -> Vec<BufStat> {
        self.bufs
            .iter()
            .enumerate()
            .map(|(index, b)| b.stat(index))
            .collect()
    }

    /// 释放缓冲块的一个引用并更新时间戳，调用前睡眠锁已经释放
    fn brelse(&self, index: usize, blockno: u32) {
        let b = &self.bufs[index];
        let _bucket = self.buckets[self.bucket(blockno)].lock();
        b.refcnt.fetch_sub(1, Ordering::Relaxed);
        b.ticks.store(self.tick(), Ordering::Relaxed);
    }

    #[inline]
    fn bucket(&self, blockno: u32) -> usize {
        blockno as usize % self.buckets.len()
    }

    /// 取下一个时间戳，调用者持有相应的桶锁
    #[inline]
    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }

    /// 不加锁地查找身份为 `key` 的第一个缓冲块
    fn find(&self, key: u64) -> Option<usize> {
        self.bufs
            .iter()
            .position(|b| b.key.load(Ordering::Acquire) == key)
    }

    /// 增加引用计数并更新时间戳，调用者持有该缓冲块的桶锁
    fn claim(&self, index: usize) {
        let b = &self.bufs[index];
        b.refcnt.fetch_add(1, Ordering::Relaxed);
        b.ticks.store(self.tick(), Ordering::Relaxed);
    }

    /// 在未被引用的缓冲块中挑选时间戳最小的一个
    fn lru_victim(&self) -> Option<usize> {
        let mut victim = None;
        let mut min_ticks = u64::MAX;
        for (index, b) in self.bufs.iter().enumerate() {
            let ticks = b.ticks.load(Ordering::Relaxed);
            if b.refcnt.load(Ordering::Relaxed) == 0 && ticks < min_ticks {
                victim = Some(index);
                min_ticks = ticks;
            }
        }
        victim
    }

    /// 按下标顺序锁住两个桶，相同时只锁一次
    fn lock_pair(
        &self,
        a: usize,
        b: usize,
    ) -> (SpinLockGuard<'_, ()>, Option<SpinLockGuard<'_, ()>>) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let first = self.buckets[lo].lock();
        let second = if hi != lo {
            Some(self.buckets[hi].lock())
        } else {
            None
        };
        (first, second)
    }

    /// 等待睡眠锁并构造 `Buf`，调用时不得持有任何自旋锁
    fn buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: ManuallyDrop::new(self.bufs[index].data.lock()),
        }
    }
}

/// 缓冲块句柄，表示当前线程独占使用的一个 `(dev, blockno)` 缓冲块。
///
/// 句柄持有缓冲块的睡眠锁和一个引用计数，丢弃时释放两者并更新时间戳。
/// 句柄可以移交给其他线程，但只有获取它的线程才能写回或释放它。
pub struct Buf<'a> {
    cache: &'a Bcache,

    /// 缓冲块在缓存数组中的下标
    index: usize,

    dev: u32,
    blockno: u32,

    /// 在 `Drop` 中先于引用计数释放
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 缓冲块内容是否已与磁盘一致
    pub fn valid(&self) -> bool {
        self.cache.bufs[self.index].valid.load(Ordering::Acquire)
    }

    /// 当前线程是否持有该缓冲块的睡眠锁
    pub fn holding(&self) -> bool {
        self.data.holding()
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// 将缓冲块内容同步写回磁盘，不改变引用计数与时间戳。
    ///
    /// # 可能的错误
    /// 当前线程未持有睡眠锁时触发 panic（`"bwrite"`）。
    pub fn bwrite(&mut self) {
        if !self.holding() {
            panic!("bwrite");
        }
        let cache = self.cache;
        cache.disk.rw(self, true);
    }

    /// 释放缓冲块，与直接丢弃 `Buf` 等价。
    ///
    /// 先释放睡眠锁（唤醒一个等待者），再在桶锁下减少引用计数并更新时间戳。
    ///
    /// # 可能的错误
    /// 当前线程未持有睡眠锁时触发 panic（`"brelse"`）。
    pub fn brelse(self) {
        drop(self);
    }

    /// 将当前缓冲块的引用计数加一，表示"钉住"该块，防止其被回收。
    ///
    /// 不涉及睡眠锁，需与 `unpin` 配对使用。
    pub fn pin(&self) {
        let b = &self.cache.bufs[self.index];
        let _bucket = self.cache.buckets[self.cache.bucket(self.blockno)].lock();
        b.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// 将当前缓冲块的引用计数减一，表示释放"钉住"状态。
    ///
    /// # 可能的错误
    /// 引用计数只剩句柄本身的那一个时触发 panic，说明 `pin`/`unpin` 不配对。
    pub fn unpin(&self) {
        let b = &self.cache.bufs[self.index];
        let _bucket = self.cache.buckets[self.cache.bucket(self.blockno)].lock();
        let rc = b.refcnt.load(Ordering::Relaxed);
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        b.refcnt.store(rc - 1, Ordering::Relaxed);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if !self.holding() {
            // 已经在处理致命错误，不再触碰锁
            if thread::panicking() {
                return;
            }
            panic!("brelse");
        }
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.brelse(self.index, self.blockno);
    }
}

/// 缓冲块元信息的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufStat {
    pub index: usize,
    pub dev: u32,
    pub blockno: u32,
    pub refcnt: usize,
    pub ticks: u64,
    pub valid: bool,
}

/// 缓冲块：元信息加上受睡眠锁保护的数据。
///
/// `key` 可以在不加锁时读取；`refcnt` 与 `ticks` 只在桶锁下修改；
/// `key` 只在全局锁与新旧两个桶锁都持有时修改；
/// `valid` 在装入新身份时清零，在持有睡眠锁时置位。
struct BufInner {
    /// `(dev << 32) | blockno`，一次原子读取即可得到完整身份
    key: AtomicU64,
    refcnt: AtomicUsize,
    ticks: AtomicU64,
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new(ticks: u64) -> Self {
        Self {
            key: AtomicU64::new(0),
            refcnt: AtomicUsize::new(0),
            ticks: AtomicU64::new(ticks),
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }

    fn stat(&self, index: usize) -> BufStat {
        let (dev, blockno) = split_key(self.key.load(Ordering::Acquire));
        BufStat {
            index,
            dev,
            blockno,
            refcnt: self.refcnt.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Acquire),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[inline]
fn make_key(dev: u32, blockno: u32) -> u64 {
    (u64::from(dev) << 32) | u64::from(blockno)
}

#[inline]
fn split_key(key: u64) -> (u32, u32) {
    ((key >> 32) as u32, key as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RamDisk;

    fn cache(nbuf: usize, nbucket: usize) -> (Arc<RamDisk>, Bcache) {
        let disk = Arc::new(RamDisk::new(64));
        let cache = Bcache::new(BcacheConfig { nbuf, nbucket }, disk.clone());
        (disk, cache)
    }

    #[test]
    fn key_packs_dev_and_blockno() {
        let key = make_key(3, 0xdead_beef);
        assert_eq!(split_key(key), (3, 0xdead_beef));
        assert_ne!(make_key(1, 0), make_key(0, 1));
    }

    #[test]
    fn initial_stamps_follow_pool_order() {
        let (_, cache) = cache(4, 2);
        let ticks: Vec<u64> = cache.stats().iter().map(|s| s.ticks).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3]);
        assert!(cache.stats().iter().all(|s| s.refcnt == 0 && !s.valid));
    }

    #[test]
    fn bread_hits_after_first_load() {
        let (disk, cache) = cache(4, 2);
        let b = cache.bread(0, 3);
        assert!(b.valid());
        assert!(b.holding());
        assert_eq!(cache.stat(0, 3).unwrap().refcnt, 1);
        drop(b);
        assert_eq!(cache.stat(0, 3).unwrap().refcnt, 0);

        let b = cache.bread(0, 3);
        assert_eq!(disk.reads(), 1);
        b.brelse();
    }

    #[test]
    fn bget_does_not_touch_disk() {
        let (disk, cache) = cache(2, 1);
        let b = cache.bget(1, 9);
        assert!(!b.valid());
        drop(b);
        assert_eq!(disk.reads(), 0);
    }

    #[test]
    fn oldest_released_buffer_is_evicted_first() {
        let (disk, cache) = cache(4, 2);
        for blockno in 0..4 {
            cache.bread(0, blockno);
        }
        let first = cache.stat(0, 0).unwrap().index;

        let b = cache.bread(0, 4);
        assert_eq!(b.index(), first);
        drop(b);
        assert_eq!(cache.stat(0, 0), None);

        // 其余三个块仍在缓存中
        for blockno in 1..4 {
            cache.bread(0, blockno);
        }
        assert_eq!(disk.reads(), 5);
    }

    #[test]
    fn recently_used_buffer_survives() {
        let (_, cache) = cache(4, 2);
        for blockno in 0..4 {
            cache.bread(0, blockno);
        }
        cache.bread(0, 0);
        let second = cache.stat(0, 1).unwrap().index;

        let b = cache.bread(0, 4);
        assert_eq!(b.index(), second);
        assert!(cache.stat(0, 0).is_some());
        assert!(cache.stat(0, 1).is_none());
    }

    #[test]
    fn held_buffers_are_never_evicted() {
        let (_, cache) = cache(3, 2);
        let held = cache.bread(0, 0);
        for blockno in 1..10 {
            let b = cache.bread(0, blockno);
            assert_ne!(b.index(), held.index());
        }
        let s = cache.stat(0, 0).unwrap();
        assert_eq!(s.index, held.index());
        assert_eq!(s.refcnt, 1);
    }

    #[test]
    fn write_survives_eviction() {
        let (disk, cache) = cache(2, 2);
        let mut b = cache.bread(0, 5);
        for (i, byte) in b.data_mut().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        b.bwrite();
        let expected = b.data().to_vec();
        drop(b);
        assert_eq!(disk.writes(), 1);
        assert_eq!(&disk.peek(0, 5)[..], &expected[..]);

        cache.bread(0, 6);
        cache.bread(0, 7);
        assert!(cache.stat(0, 5).is_none());

        let b = cache.bread(0, 5);
        assert_eq!(b.data(), &expected[..]);
        assert_eq!(disk.reads(), 4);
    }

    #[test]
    fn pinned_buffer_is_not_evicted() {
        let (_, cache) = cache(2, 2);
        let b = cache.bread(0, 1);
        b.pin();
        let pinned = b.index();
        drop(b);
        assert_eq!(cache.stat(0, 1).unwrap().refcnt, 1);

        for blockno in 2..6 {
            let b = cache.bread(0, blockno);
            assert_ne!(b.index(), pinned);
        }

        let b = cache.bread(0, 1);
        assert_eq!(b.index(), pinned);
        b.unpin();
        drop(b);
        assert_eq!(cache.stat(0, 1).unwrap().refcnt, 0);
    }

    #[test]
    #[should_panic(expected = "buf unpin not match")]
    fn unpin_without_pin_panics() {
        let (_, cache) = cache(2, 2);
        let b = cache.bread(0, 1);
        b.unpin();
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn exhausted_cache_panics() {
        let (_, cache) = cache(2, 2);
        let _a = cache.bread(0, 1);
        let _b = cache.bread(0, 2);
        cache.bread(0, 3);
    }

    #[test]
    #[should_panic(expected = "binit")]
    fn empty_geometry_panics() {
        cache(0, 2);
    }

    #[test]
    fn bwrite_by_non_holder_is_fatal() {
        let (disk, cache) = cache(2, 2);
        let b = cache.bread(0, 1);
        let res = thread::scope(|s| {
            s.spawn(move || {
                let mut b = b;
                b.bwrite();
            })
            .join()
        });
        assert!(res.is_err());
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    fn brelse_by_non_holder_is_fatal() {
        let (_, cache) = cache(2, 2);
        let b = cache.bread(0, 1);
        let res = thread::scope(|s| s.spawn(move || b.brelse()).join());
        assert!(res.is_err());
        assert_eq!(cache.stat(0, 1).unwrap().refcnt, 1);
    }
}
