//! 内存盘：用一块内存模拟块设备，从未写过的块读出全零

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::consts::fs::BSIZE;
use crate::fs::Buf;
use crate::spinlock::SpinLock;

use super::BlockDevice;

/// 内存盘设备
///
/// 每个设备号都有 `nblocks` 个块，块内容按 `(dev, blockno)` 保存。
/// 读写次数分别计数，方便观察块缓存实际访问磁盘的情况。
pub struct RamDisk {
    nblocks: u32,
    blocks: SpinLock<BTreeMap<(u32, u32), Box<[u8; BSIZE]>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            nblocks,
            blocks: SpinLock::new(BTreeMap::new(), "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 每个设备的块数
    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// 迄今为止从盘上读出的块数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 迄今为止写入盘中的块数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 绕过块缓存直接查看盘上的块内容
    pub fn peek(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        match self.blocks.lock().get(&(dev, blockno)) {
            Some(block) => **block,
            None => [0; BSIZE],
        }
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        let key = (buf.dev(), buf.blockno());
        if key.1 >= self.nblocks {
            panic!("ramdisk: blockno {} out of range", key.1);
        }

        let mut blocks = self.blocks.lock();
        if writing {
            blocks
                .entry(key)
                .or_insert_with(|| Box::new([0; BSIZE]))
                .copy_from_slice(buf.data());
            self.writes.fetch_add(1, Ordering::SeqCst);
        } else {
            match blocks.get(&key) {
                Some(block) => buf.data_mut().copy_from_slice(&block[..]),
                None => buf.data_mut().fill(0),
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        drop(blocks);

        trace!(
            "ramdisk: {} dev {} block {}",
            if writing { "write" } else { "read" },
            key.0,
            key.1
        );
    }
}
