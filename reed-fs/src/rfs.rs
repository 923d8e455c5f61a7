//! # 文件系统层
//!
//! 搭出卷布局并拥有各共享资源：扇区缓冲、空闲位图、打开 inode 表。
//! [`Inode`] 与 [`Dir`] 都攥着一份 [`Arc<ReedFileSystem>`]。

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use block_dev::BlockDevice;
use log::{info, warn};
use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::dir::Dir;
use crate::inode::Inode;
use crate::layout::{Bitmap, SuperBlock};
use crate::sector::SectorId;
use crate::{BLOCK_SIZE, FREE_MAP_SECTOR, ROOT_SECTOR, SUPER_BLOCK_SECTOR};

const ZEROES: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// 文件系统实例
pub struct ReedFileSystem {
    cache: Arc<BufferCache>,
    /// 空闲位图的读-改-写在此锁下串行化
    free_map: Mutex<Bitmap>,
    /// 扇区号 → 规范 inode 对象
    pub(crate) open_inodes: Mutex<BTreeMap<u32, Weak<Inode>>>,
    total_sectors: u32,
}

impl ReedFileSystem {
    /// 在`dev`上建全新的文件系统：清零整卷，写超级块与空闲位图，
    /// 造出根目录
    pub fn format(dev: Arc<dyn BlockDevice>, total_sectors: u32) -> Arc<Self> {
        // 三个保留扇区之外，根目录的`.`/`..`还要一个数据扇区
        assert!(total_sectors > ROOT_SECTOR.raw() + 1, "volume too small");
        let cache = Arc::new(BufferCache::new(dev));

        for raw in 0..total_sectors {
            cache.write_at(SectorId::new(raw), &ZEROES, false, 0);
        }

        let mut super_block = SuperBlock::default();
        super_block.init(total_sectors);
        cache.write_at(SUPER_BLOCK_SECTOR, super_block.as_bytes(), true, 0);

        let fs = Arc::new(Self {
            cache,
            free_map: Mutex::new(Bitmap::new(FREE_MAP_SECTOR, 1)),
            open_inodes: Mutex::new(BTreeMap::new()),
            total_sectors,
        });

        {
            let free_map = fs.free_map.lock();
            // 元数据扇区保留，卷外的位直接填满
            for reserved in [SUPER_BLOCK_SECTOR, FREE_MAP_SECTOR, ROOT_SECTOR] {
                free_map.set_used(&fs.cache, reserved);
            }
            for raw in total_sectors..free_map.capacity() as u32 {
                free_map.set_used(&fs.cache, SectorId::new(raw));
            }
        }

        Dir::create(&fs, ROOT_SECTOR, ROOT_SECTOR).expect("failed to create the root directory");
        fs.cache.write_all();
        info!("formatted {total_sectors} sectors");
        fs
    }

    /// 装载`dev`上既有的文件系统
    pub fn load(dev: Arc<dyn BlockDevice>) -> Arc<Self> {
        let cache = Arc::new(BufferCache::new(dev));

        let mut super_block = SuperBlock::default();
        cache.read_at(SUPER_BLOCK_SECTOR, super_block.as_bytes_mut(), true, 0);
        assert!(super_block.is_valid(), "not a reed-fs volume");

        Arc::new(Self {
            cache,
            free_map: Mutex::new(Bitmap::new(FREE_MAP_SECTOR, 1)),
            open_inodes: Mutex::new(BTreeMap::new()),
            total_sectors: super_block.total_sectors(),
        })
    }

    /// 打开根目录
    pub fn root_dir(self: &Arc<Self>) -> Dir {
        Dir::open_root(self).expect("the root directory is damaged")
    }

    /// 要一个清零的空闲扇区
    pub fn alloc_sector(&self) -> Option<SectorId> {
        let free_map = self.free_map.lock();
        let sector = free_map.alloc(&self.cache);
        if sector.is_none() {
            warn!("free map exhausted");
        }
        sector
    }

    /// 归还扇区。内容先清零，陈旧数据与 inode 魔数一并抹掉
    pub fn free_sector(&self, sector: SectorId) {
        self.cache.write_at(sector, &ZEROES, false, 0);
        let free_map = self.free_map.lock();
        free_map.dealloc(&self.cache, sector);
    }

    /// 把全部脏扇区同步写回设备
    pub fn sync_all(&self) {
        self.cache.write_all();
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }
}
