//! # 物理页帧表
//!
//! 管理用户页池中的全部物理页帧：分配、钉住、逐出。
//!
//! 每个页帧要么在空闲队列，要么在已分配队列，二者必居其一。
//! 空闲队列栈式复用（后进先出），逐出扫描则从已分配队列的队首
//! 开始（先进先出）。
//!
//! 页帧与虚拟页之间是可拆解的双向弱关联：帧表持有页的 [`Weak`]
//! 引用，页层记录 [`FrameId`]；逐出或释放时双方引用都被清除，
//! 不构成共享所有权。
//!
//! 表内一切状态由唯一一把互斥锁保护。[`Page::evict`] 在持有表锁时
//! 被回调，页层实现不得重入帧表。

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Weak;
use alloc::vec::Vec;

use derive_more::{From, Into};
use ksync::SpinMutex;
use log::{error, trace};
use spin::Once;

static FRAME_TABLE: Once<FrameTable> = Once::new();

/// 开机时以用户页池初始化全局帧表，仅一次
pub fn init(pool: impl IntoIterator<Item = usize>) {
    FRAME_TABLE.call_once(|| FrameTable::new(pool));
}

fn table() -> &'static FrameTable {
    FRAME_TABLE.get().expect("frame table is not initialized")
}

pub fn alloc() -> FrameId {
    table().alloc()
}

pub fn free(frame: FrameId) {
    table().free(frame);
}

pub fn pin(frame: FrameId) {
    table().pin(frame);
}

pub fn unpin(frame: FrameId) {
    table().unpin(frame);
}

pub fn evict(frame: FrameId) -> bool {
    table().evict(frame)
}

pub fn install(frame: FrameId, page: Weak<dyn Page>) {
    table().install(frame, page);
}

pub fn kaddr(frame: FrameId) -> usize {
    table().kaddr(frame)
}

/// 装入页帧的虚拟页，由页层实现
pub trait Page: Send + Sync {
    /// 尝试逐出此页：写回其后备存储并解除 MMU 映射。
    /// 返回`false`表示此页目前拒绝被逐出。
    fn evict(&self) -> bool;
}

/// 页帧句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct FrameId(usize);

struct Frame {
    /// 页帧的内核可见地址，构造后不变
    kaddr: usize,
    /// 当前装入的虚拟页
    page: Option<Weak<dyn Page>>,
    pinned: bool,
}

#[derive(Default)]
struct TableInner {
    frames: Vec<Frame>,
    /// 空闲帧下标栈，栈顶在尾部
    free: Vec<usize>,
    /// 已分配帧下标，按分配先后排列
    allocated: VecDeque<usize>,
}

/// 页帧表
///
/// 全局唯一实例经模块级函数使用；测试可自建实例。
pub struct FrameTable {
    inner: SpinMutex<TableInner>,
}

impl FrameTable {
    /// 抽干`pool`，每个地址建一个空闲页帧
    pub fn new(pool: impl IntoIterator<Item = usize>) -> Self {
        let frames: Vec<Frame> = pool
            .into_iter()
            .map(|kaddr| Frame {
                kaddr,
                page: None,
                pinned: false,
            })
            .collect();
        let free = (0..frames.len()).collect();

        Self {
            inner: SpinMutex::new(TableInner {
                frames,
                free,
                allocated: VecDeque::new(),
            }),
        }
    }

    /// 取一个页帧，必要时逐出别的页。
    ///
    /// 返回的页帧已钉住且未装页，调用者装好页后自行解钉。
    /// 没有空闲帧且没有可逐出的帧时 panic。
    pub fn alloc(&self) -> FrameId {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => inner.pick_and_evict(),
        };

        let frame = &mut inner.frames[index];
        frame.page = None;
        frame.pinned = true;
        inner.allocated.push_back(index);
        FrameId(index)
    }

    /// 归还页帧。不逐出帧内数据，只是回收
    pub fn free(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        let index = frame.0;
        debug_assert!(!inner.free.contains(&index), "double free of {frame:?}");

        let frame = &mut inner.frames[index];
        frame.page = None;
        frame.pinned = false;
        if let Some(pos) = inner.allocated.iter().position(|&i| i == index) {
            inner.allocated.remove(pos);
        }
        inner.free.push(index);
    }

    /// 此后页帧不会被逐出，直到 [`unpin`](Self::unpin)。
    ///
    /// 钉是布尔而非计数：重复钉住后一次解钉即全部解除。
    pub fn pin(&self, frame: FrameId) {
        self.inner.lock().frames[frame.0].pinned = true;
    }

    pub fn unpin(&self, frame: FrameId) {
        self.inner.lock().frames[frame.0].pinned = false;
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.inner.lock().frames[frame.0].pinned
    }

    /// 就地逐出一个已分配的页帧。
    ///
    /// 页帧被钉住或页拒绝逐出时返回`false`，不改动任何状态。
    /// 成功时清除页引用并把帧从已分配队列摘下，后续去向由调用者
    /// 决定。
    pub fn evict(&self, frame: FrameId) -> bool {
        self.inner.lock().evict(frame.0)
    }

    /// 登记装入页帧的虚拟页
    pub fn install(&self, frame: FrameId, page: Weak<dyn Page>) {
        self.inner.lock().frames[frame.0].page = Some(page);
    }

    pub fn kaddr(&self, frame: FrameId) -> usize {
        self.inner.lock().frames[frame.0].kaddr
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn allocated_frames(&self) -> usize {
        self.inner.lock().allocated.len()
    }
}

impl TableInner {
    fn evict(&mut self, index: usize) -> bool {
        let frame = &self.frames[index];
        if frame.pinned {
            return false;
        }
        if let Some(page) = frame.page.as_ref().and_then(Weak::upgrade) {
            if !page.evict() {
                return false;
            }
        }

        let frame = &mut self.frames[index];
        frame.page = None;
        if let Some(pos) = self.allocated.iter().position(|&i| i == index) {
            self.allocated.remove(pos);
        }
        true
    }

    /// 挑一个帧逐出并返回之。假定表锁已持有。
    ///
    /// TODO: 换成时钟置换，现在是最朴素的线性扫描。
    fn pick_and_evict(&mut self) -> usize {
        let candidates: Vec<usize> = self.allocated.iter().copied().collect();
        for index in candidates {
            if self.evict(index) {
                trace!("evicted frame at {:#x}", self.frames[index].kaddr);
                return index;
            }
        }

        error!(
            "frame pool exhausted: {} frames allocated, none evictable",
            self.allocated.len()
        );
        panic!("out of user frames: every frame is pinned or refuses eviction");
    }
}
