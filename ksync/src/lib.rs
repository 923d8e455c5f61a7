//! # 内核同步层
//!
//! 核心子系统（帧表、扇区缓冲、目录层）所依赖的阻塞原语：
//! 互斥锁与条件变量。
//!
//! 在完整内核里，等待者会挂入调度器的等待队列；这里没有调度器，
//! 等待以自旋实现，语义不变：互斥锁保证临界区互斥，条件变量保证
//! 不丢失唤醒（等待者在**持锁时**对代数采样，见 [`Condvar`]）。

#![no_std]

mod condvar;
mod mutex;

pub use self::{
    condvar::Condvar,
    mutex::{SpinMutex, SpinMutexGuard},
};
