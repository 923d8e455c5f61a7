//! # reed-fs
//!
//! 教学用文件系统基底，自下而上：
//!
//! - 扇区缓冲层：固定 64 槽的缓冲区，所有扇区读写都经过它，
//!   每个槽位是一台小状态机（见 [`block_cache`]）
//! - 磁盘数据结构层：超级块、空闲位图、inode、目录槽位（见 [`layout`]）
//! - 索引节点层：以扇区号寻址的 [`Inode`]，同一磁盘 inode 的所有
//!   句柄共享一个对象
//! - 目录层：把目录 inode 解释为定长槽位数组，逐级解析路径
//!   （见 [`Dir`]）
//!
//! 进程调度、页表与系统调用属于内核其它部分，不在本 crate。

#![no_std]

extern crate alloc;

pub mod block_cache;
pub use block_cache::BufferCache;

pub mod layout;

mod sector;
pub use sector::SectorId;

mod error;
pub use error::Error;

mod inode;
pub use inode::Inode;

mod dir;
pub use dir::{parse_filename, Dir};

mod rfs;
pub use rfs::ReedFileSystem;

pub use block_dev::BlockDevice;

/// 扇区字节数
pub const BLOCK_SIZE: usize = 512;
/// 一个扇区的位数
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 文件名长度上限（字节）
pub const NAME_MAX: usize = 27;

/// 超级块所在扇区
pub const SUPER_BLOCK_SECTOR: SectorId = SectorId::new(0);
/// 空闲位图所在扇区
pub const FREE_MAP_SECTOR: SectorId = SectorId::new(1);
/// 根目录 inode 所在扇区
pub const ROOT_SECTOR: SectorId = SectorId::new(2);
