use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mutex::SpinMutexGuard;

/// 条件变量
///
/// 以代数计数实现：每次通知让代数前进一步，等待者在持锁时采样当前
/// 代数，释放锁后等代数变化再重新上锁。由于改变谓词必须先取得同一把
/// 锁，通知一定发生在采样之后，不会丢失唤醒；允许虚假唤醒，调用者
/// 须在循环里复查谓词。
pub struct Condvar {
    generation: AtomicUsize,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
        }
    }

    /// 释放`guard`并等待通知，返回重新上锁的守卫
    pub fn wait<'a, T: ?Sized>(&self, guard: SpinMutexGuard<'a, T>) -> SpinMutexGuard<'a, T> {
        let mutex = guard.mutex();
        // 采样必须先于放锁
        let begin = self.generation.load(Ordering::Acquire);
        drop(guard);

        while self.generation.load(Ordering::Acquire) == begin {
            hint::spin_loop();
        }
        mutex.lock()
    }

    /// 唤醒全部等待者
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
