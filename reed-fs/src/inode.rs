//! # 索引节点层
//!
//! [`Inode`] 以扇区号寻址：inode 元数据独占该扇区。打开的 inode
//! 经打开表规范化，同一磁盘 inode 的所有句柄共享一个对象，于是
//! 也共享同一把目录锁。
//!
//! 句柄生命周期映射到 [`Arc`]：重开即克隆、关闭即丢弃、打开计数
//! 即强引用计数。被标记删除的 inode 在最后一个句柄关闭时连同数据
//! 扇区一并归还。

use alloc::sync::Arc;
use core::fmt;

use ksync::SpinMutex;
use spin::Mutex;

use crate::layout::{DiskInode, InodeKind};
use crate::rfs::ReedFileSystem;
use crate::sector::SectorId;
use crate::BLOCK_SIZE;

/// 打开的 inode
pub struct Inode {
    sector: SectorId,
    fs: Arc<ReedFileSystem>,
    /// 指向同一磁盘 inode 的所有目录句柄共享此锁
    dir_lock: SpinMutex<()>,
    /// 元数据读-改-写的串行点，兼管删除标记
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    removed: bool,
}

impl Inode {
    /// 在`sector`写一个空的磁盘 inode
    pub fn create(fs: &Arc<ReedFileSystem>, sector: SectorId, kind: InodeKind) {
        let mut disk_inode = DiskInode::zeroed();
        disk_inode.init(kind);
        fs.cache().write_at(sector, disk_inode.as_bytes(), true, 0);
    }

    /// 打开`sector`处的 inode。已打开则共享既有对象；
    /// 扇区里不是 inode 则返回空。
    pub fn open(fs: &Arc<ReedFileSystem>, sector: SectorId) -> Option<Arc<Inode>> {
        let mut open_inodes = fs.open_inodes.lock();
        if let Some(inode) = open_inodes.get(&sector.raw()).and_then(|weak| weak.upgrade()) {
            return Some(inode);
        }

        let mut disk_inode = DiskInode::zeroed();
        fs.cache().read_at(sector, disk_inode.as_bytes_mut(), true, 0);
        if !disk_inode.is_valid() {
            return None;
        }

        let inode = Arc::new(Inode {
            sector,
            fs: fs.clone(),
            dir_lock: SpinMutex::new(()),
            inner: Mutex::new(InodeInner { removed: false }),
        });
        open_inodes.insert(sector.raw(), Arc::downgrade(&inode));
        Some(inode)
    }

    /// 再开一个句柄
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// 此 inode 现存的句柄数
    pub fn open_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.load_disk_inode().is_dir()
    }

    /// 对象当前的字节大小
    pub fn size(&self) -> usize {
        self.load_disk_inode().len()
    }

    /// 从`offset`读数据填充`buf`，返回读到的字节数。
    /// 碰到对象末尾即短读。
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let disk_inode = self.load_disk_inode();
        let end = (offset + buf.len()).min(disk_inode.len());
        if offset >= end {
            return 0;
        }

        let mut start = offset;
        let mut read = 0;
        while start < end {
            let block_index = start / BLOCK_SIZE;
            let block_end = ((block_index + 1) * BLOCK_SIZE).min(end);
            let count = block_end - start;
            self.fs.cache().read_at(
                disk_inode.block(block_index),
                &mut buf[read..read + count],
                false,
                start % BLOCK_SIZE,
            );
            read += count;
            start = block_end;
        }
        read
    }

    /// 把`buf`写到`offset`处，按需扩展对象，返回写进的字节数。
    /// 空闲扇区耗尽或对象到达大小上限时短写。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        // 持有元数据锁直到新长度落盘，并发写互不踩踏
        let _meta = self.inner.lock();
        let mut disk_inode = self.load_disk_inode();

        let mut end = (offset + buf.len()).min(DiskInode::MAX_LEN);
        if end > disk_inode.len() {
            self.grow(&mut disk_inode, end);
            end = end.min(disk_inode.len());
        }
        if offset >= end {
            // 增长到手多少记多少，扇区不能悬在位图里
            self.store_disk_inode(&disk_inode);
            return 0;
        }

        let mut start = offset;
        let mut written = 0;
        while start < end {
            let block_index = start / BLOCK_SIZE;
            let block_end = ((block_index + 1) * BLOCK_SIZE).min(end);
            let count = block_end - start;
            self.fs.cache().write_at(
                disk_inode.block(block_index),
                &buf[written..written + count],
                false,
                start % BLOCK_SIZE,
            );
            written += count;
            start = block_end;
        }

        self.store_disk_inode(&disk_inode);
        written
    }

    /// 标记删除。真正的释放发生在最后一个句柄关闭时
    pub fn remove(&self) {
        self.inner.lock().removed = true;
    }

    /// 目录层借用的共享锁
    pub fn dir_lock(&self) -> &SpinMutex<()> {
        &self.dir_lock
    }

    pub(crate) fn fs(&self) -> &Arc<ReedFileSystem> {
        &self.fs
    }

    /// 扩展到`new_len`字节，空闲扇区不足时止步于已到手的部分
    fn grow(&self, disk_inode: &mut DiskInode, new_len: usize) {
        let old_blocks = DiskInode::count_blocks(disk_inode.len());
        let new_blocks = DiskInode::count_blocks(new_len);

        for index in old_blocks..new_blocks {
            match self.fs.alloc_sector() {
                // 新扇区来自清零过的空闲池
                Some(sector) => disk_inode.set_block(index, sector),
                None => {
                    disk_inode.set_len(index * BLOCK_SIZE);
                    return;
                }
            }
        }
        disk_inode.set_len(new_len);
    }

    fn load_disk_inode(&self) -> DiskInode {
        let mut disk_inode = DiskInode::zeroed();
        self.fs
            .cache()
            .read_at(self.sector, disk_inode.as_bytes_mut(), true, 0);
        disk_inode
    }

    fn store_disk_inode(&self, disk_inode: &DiskInode) {
        self.fs
            .cache()
            .write_at(self.sector, disk_inode.as_bytes(), true, 0);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let mut open_inodes = self.fs.open_inodes.lock();
        // 打开表可能已经登记了同扇区的新对象，那就不归我们收拾
        let resurrected = open_inodes
            .get(&self.sector.raw())
            .is_some_and(|weak| weak.strong_count() > 0);
        if resurrected {
            return;
        }
        open_inodes.remove(&self.sector.raw());

        if self.inner.get_mut().removed {
            // 持着打开表锁释放，挡住同扇区的并发重开
            let disk_inode = self.load_disk_inode();
            for sector in disk_inode.data_sectors() {
                self.fs.free_sector(sector);
            }
            self.fs.free_sector(self.sector);
        }
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("sector", &self.sector)
            .finish_non_exhaustive()
    }
}
