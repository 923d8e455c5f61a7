//! # 扇区缓冲层
//!
//! 固定 64 槽的缓冲区，所有扇区 I/O 都从这里过。每个槽位是一台
//! 状态机：
//!
//! ```text
//! Ready ⇄ BeingRead        装载设备数据
//! Ready ⇄ BeingWritten     写回设备
//! Ready → PendingWrite     write_all 已登记、尚未开始的写回
//! 非在途 → Evicted          被选为牺牲槽，等待改派
//! ```
//!
//! 在途状态（BeingRead/BeingWritten）下有且只有一个线程在做设备
//! I/O，其余访问者在槽位的条件变量上等待。`Ready`下允许多个访问者
//! 同时拷贝缓冲区，`accessors`计数把槽位钉在缓冲区里；本层不对
//! 访问者互相排序，重叠写的互斥由上层的 inode 锁、目录锁保证。
//!
//! 槽位归属（哪个扇区住在哪个槽）只在指派锁下改变，因此同一扇区
//! 永远至多占一个槽。指派锁和单个槽位锁可以嵌套（先指派后槽位），
//! 槽位锁之间互不嵌套，设备 I/O 时不持任何锁。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::hint;
use core::ptr;

use block_dev::BlockDevice;
use enumflags2::{bitflags, BitFlags};
use ksync::{Condvar, SpinMutex};
use log::{debug, trace};

use crate::sector::SectorId;
use crate::BLOCK_SIZE;

/// 缓冲槽位总数
pub const CACHE_SECTORS: usize = 64;

/// 槽位信息位
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInfo {
    /// 最近被访问过，时钟扫描给它第二次机会
    Accessed = 0b001,
    /// 缓冲区内容比设备新
    Dirty = 0b010,
    /// 文件系统元数据，逐出时尽量保留
    Meta = 0b100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    PendingWrite,
    BeingWritten,
    BeingRead,
    Evicted,
}

struct SlotInner {
    /// 住在此槽的扇区，`Evicted`时为空
    sector: Option<SectorId>,
    state: SlotState,
    info: BitFlags<CacheInfo>,
    /// 正在拷贝缓冲区的线程数，非零时禁止逐出
    accessors: usize,
}

/// 槽位数据区
///
/// 仅在`Ready`下经访问者协议并发拷贝，其余状态由唯一的在途线程
/// 独占。
struct SectorBuf(UnsafeCell<[u8; BLOCK_SIZE]>);

unsafe impl Sync for SectorBuf {}

impl SectorBuf {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; BLOCK_SIZE]))
    }

    fn get(&self) -> *mut [u8; BLOCK_SIZE] {
        self.0.get()
    }
}

struct Slot {
    inner: SpinMutex<SlotInner>,
    /// 状态机走动时广播
    changed: Condvar,
    buffer: SectorBuf,
}

enum Victim {
    /// 已经以`BeingRead`占位，取数据即可
    Claimed(usize),
    /// 脏槽，先写回再重选
    Flush(usize),
    None,
}

/// 扇区缓冲区
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    slots: Box<[Slot]>,
    /// 指派锁，兼作时钟指针
    assign: SpinMutex<usize>,
    /// 预读队列
    readahead: SpinMutex<VecDeque<SectorId>>,
    readahead_changed: Condvar,
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slots = (0..CACHE_SECTORS)
            .map(|_| Slot {
                inner: SpinMutex::new(SlotInner {
                    sector: None,
                    state: SlotState::Evicted,
                    info: BitFlags::empty(),
                    accessors: 0,
                }),
                changed: Condvar::new(),
                buffer: SectorBuf::new(),
            })
            .collect();

        Self {
            dev,
            slots,
            assign: SpinMutex::new(0),
            readahead: SpinMutex::new(VecDeque::new()),
            readahead_changed: Condvar::new(),
        }
    }

    /// 从`sector`的缓存映像读 `[offset, offset + buf.len())`
    pub fn read_at(&self, sector: SectorId, buf: &mut [u8], is_meta: bool, offset: usize) {
        self.io_at(sector, buf.as_mut_ptr(), buf.len(), is_meta, offset, false);
    }

    /// 写进`sector`的缓存映像并标脏
    pub fn write_at(&self, sector: SectorId, buf: &[u8], is_meta: bool, offset: usize) {
        self.io_at(sector, buf.as_ptr().cast_mut(), buf.len(), is_meta, offset, true);
    }

    /// 同 [`read_at`](Self::read_at)，完成后把`next`排进预读队列
    pub fn read_at_ahead(
        &self,
        sector: SectorId,
        buf: &mut [u8],
        is_meta: bool,
        offset: usize,
        next: SectorId,
    ) {
        self.read_at(sector, buf, is_meta, offset);
        self.queue_readahead(next);
    }

    /// 同 [`write_at`](Self::write_at)，完成后把`next`排进预读队列
    pub fn write_at_ahead(
        &self,
        sector: SectorId,
        buf: &[u8],
        is_meta: bool,
        offset: usize,
        next: SectorId,
    ) {
        self.write_at(sector, buf, is_meta, offset);
        self.queue_readahead(next);
    }

    /// 同步写回全部脏槽
    pub fn write_all(&self) {
        // 先统一登记成待写，再逐个推进到写回；
        // 并发的 write_all 会互相认领对方登记的槽位
        for slot in self.slots.iter() {
            let mut inner = slot.inner.lock();
            if inner.state == SlotState::Ready && inner.info.contains(CacheInfo::Dirty) {
                inner.state = SlotState::PendingWrite;
            }
        }

        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            let mut inner = slot.inner.lock();
            if inner.state == SlotState::PendingWrite {
                inner.state = SlotState::BeingWritten;
                inner.info.remove(CacheInfo::Dirty);
                drop(inner);
                self.writeback(index, false);
            }
        }
    }

    fn io_at(
        &self,
        sector: SectorId,
        buf: *mut u8,
        len: usize,
        is_meta: bool,
        offset: usize,
        is_write: bool,
    ) {
        assert!(offset + len <= BLOCK_SIZE);
        let index = self.acquire(sector, is_meta);
        let slot = &self.slots[index];

        // 槽位 Ready 且本线程已计入访问者，可以不持锁拷贝
        unsafe {
            let data = slot.buffer.get().cast::<u8>().add(offset);
            if is_write {
                ptr::copy_nonoverlapping(buf.cast_const(), data, len);
            } else {
                ptr::copy_nonoverlapping(data.cast_const(), buf, len);
            }
        }

        let mut inner = slot.inner.lock();
        inner.accessors -= 1;
        if is_write {
            inner.info |= CacheInfo::Dirty;
        }
        drop(inner);
        slot.changed.notify_all();
    }

    /// 让`sector`住进某个 Ready 槽位并登记一个访问者，返回槽位下标
    fn acquire(&self, sector: SectorId, is_meta: bool) -> usize {
        loop {
            let mut hand = self.assign.lock();

            if let Some(index) = self.position(sector) {
                let slot = &self.slots[index];
                let mut inner = slot.inner.lock();
                // 查找和上锁之间槽位可能刚被逐出
                if inner.sector != Some(sector) {
                    continue;
                }
                match inner.state {
                    SlotState::Ready => {
                        inner.accessors += 1;
                        inner.info |= CacheInfo::Accessed;
                        if is_meta {
                            inner.info |= CacheInfo::Meta;
                        }
                        return index;
                    }
                    // 在途或待写：等状态机走完再重试
                    SlotState::PendingWrite | SlotState::BeingWritten | SlotState::BeingRead => {
                        drop(hand);
                        drop(slot.changed.wait(inner));
                        continue;
                    }
                    SlotState::Evicted => unreachable!("an evicted slot holds no sector"),
                }
            }

            match self.pick_victim(&mut hand, sector, is_meta, false) {
                Victim::Claimed(index) => {
                    drop(hand);
                    self.load(index, sector, true);
                    return index;
                }
                Victim::Flush(index) => {
                    drop(hand);
                    self.writeback(index, true);
                }
                Victim::None => {
                    // 全部槽位都有访问者或在途，稍后重试
                    drop(hand);
                    hint::spin_loop();
                }
            }
        }
    }

    /// 哪个槽住着`sector`。调用者须持指派锁
    fn position(&self, sector: SectorId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.inner.lock().sector == Some(sector))
    }

    /// 选牺牲槽。调用者须持指派锁。
    ///
    /// 依次让步：空槽 → 干净非元数据槽（时钟扫描，Accessed 位第二
    /// 次机会）→ 干净槽 → 脏槽（此时只推进到`BeingWritten`，由调用
    /// 者写回后重选）。`strict`是预读模式：只要空槽或完全闲置的干净
    /// 槽，拿不到就算了。
    fn pick_victim(
        &self,
        hand: &mut usize,
        sector: SectorId,
        is_meta: bool,
        strict: bool,
    ) -> Victim {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut inner = slot.inner.lock();
            if inner.state == SlotState::Evicted {
                Self::claim(&mut inner, sector, is_meta);
                return Victim::Claimed(index);
            }
        }

        let n = self.slots.len();
        for step in 0..2 * n {
            let index = (*hand + step) % n;
            let slot = &self.slots[index];
            let mut inner = slot.inner.lock();
            if inner.state != SlotState::Ready || inner.accessors > 0 {
                continue;
            }
            if inner.info.contains(CacheInfo::Accessed) {
                // 预读不清 Accessed，免得冲掉别人刚装载的扇区
                if !strict {
                    inner.info.remove(CacheInfo::Accessed);
                }
                continue;
            }
            if inner.info.intersects(CacheInfo::Dirty | CacheInfo::Meta) {
                continue;
            }
            *hand = (index + 1) % n;
            Self::claim(&mut inner, sector, is_meta);
            return Victim::Claimed(index);
        }

        if strict {
            return Victim::None;
        }

        // 干净槽用完了，元数据槽也上
        for step in 0..n {
            let index = (*hand + step) % n;
            let slot = &self.slots[index];
            let mut inner = slot.inner.lock();
            if inner.state == SlotState::Ready
                && inner.accessors == 0
                && !inner.info.contains(CacheInfo::Dirty)
            {
                *hand = (index + 1) % n;
                Self::claim(&mut inner, sector, is_meta);
                return Victim::Claimed(index);
            }
        }

        // 只剩脏槽可选
        for step in 0..n {
            let index = (*hand + step) % n;
            let slot = &self.slots[index];
            let mut inner = slot.inner.lock();
            if inner.state == SlotState::Ready && inner.accessors == 0 {
                *hand = (index + 1) % n;
                if inner.info.contains(CacheInfo::Dirty) {
                    inner.state = SlotState::BeingWritten;
                    inner.info.remove(CacheInfo::Dirty);
                    return Victim::Flush(index);
                }
                Self::claim(&mut inner, sector, is_meta);
                return Victim::Claimed(index);
            }
        }

        Victim::None
    }

    /// 以`BeingRead`占下槽位。调用者须同时持指派锁与槽位锁
    fn claim(inner: &mut SlotInner, sector: SectorId, is_meta: bool) {
        debug_assert_eq!(inner.accessors, 0);
        inner.sector = Some(sector);
        inner.state = SlotState::BeingRead;
        inner.info = if is_meta {
            CacheInfo::Meta.into()
        } else {
            BitFlags::empty()
        };
    }

    /// 装载已占位的槽。`register`则顺手登记一个访问者
    fn load(&self, index: usize, sector: SectorId, register: bool) {
        let mut data = [0u8; BLOCK_SIZE];
        self.dev.read_block(sector.index(), &mut data);

        let slot = &self.slots[index];
        let mut inner = slot.inner.lock();
        debug_assert_eq!(inner.state, SlotState::BeingRead);
        debug_assert_eq!(inner.sector, Some(sector));
        // 在途状态下没有访问者，缓冲区归本线程
        unsafe {
            *slot.buffer.get() = data;
        }
        inner.state = SlotState::Ready;
        if register {
            inner.accessors = 1;
            inner.info |= CacheInfo::Accessed;
        }
        drop(inner);
        slot.changed.notify_all();
    }

    /// 写回槽位缓冲。进入前状态已置为`BeingWritten`
    fn writeback(&self, index: usize, evict_after: bool) {
        let slot = &self.slots[index];
        let (sector, data) = {
            let inner = slot.inner.lock();
            debug_assert_eq!(inner.state, SlotState::BeingWritten);
            let sector = inner.sector.expect("write-back of an unassigned slot");
            (sector, unsafe { *slot.buffer.get() })
        };
        self.dev.write_block(sector.index(), &data);

        let mut inner = slot.inner.lock();
        if evict_after {
            trace!("evicted sector {} from the cache", sector.raw());
            inner.sector = None;
            inner.state = SlotState::Evicted;
        } else {
            inner.state = SlotState::Ready;
        }
        drop(inner);
        slot.changed.notify_all();
    }

    fn queue_readahead(&self, sector: SectorId) {
        self.readahead.lock().push_back(sector);
        self.readahead_changed.notify_all();
    }

    /// 处理预读队列中的一项，队列为空返回`false`
    pub fn readahead_once(&self) -> bool {
        let Some(sector) = self.readahead.lock().pop_front() else {
            return false;
        };
        self.try_load_ahead(sector);
        true
    }

    /// 预读守护循环，由嵌入方用一个线程驱动
    pub fn run_readahead(&self) -> ! {
        loop {
            let mut queue = self.readahead.lock();
            let sector = loop {
                match queue.pop_front() {
                    Some(sector) => break sector,
                    None => queue = self.readahead_changed.wait(queue),
                }
            };
            drop(queue);
            self.try_load_ahead(sector);
        }
    }

    /// 尽力而为的异步装载，有任何争用就放弃
    fn try_load_ahead(&self, sector: SectorId) {
        let Some(mut hand) = self.assign.try_lock() else {
            debug!("read-ahead of sector {} dropped: cache busy", sector.raw());
            return;
        };
        if self.position(sector).is_some() {
            return;
        }
        match self.pick_victim(&mut hand, sector, false, true) {
            Victim::Claimed(index) => {
                drop(hand);
                self.load(index, sector, false);
                trace!("read sector {} ahead", sector.raw());
            }
            _ => debug!("read-ahead of sector {} dropped: no idle slot", sector.raw()),
        }
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.write_all();
    }
}
