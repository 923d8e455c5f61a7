//! # 磁盘数据结构层
//!
//! 卷布局：超级块 | 空闲位图 | 其余扇区
//!
//! 没有独立的 inode 区：inode 就放在它的扇区号所指的扇区里，
//! 数据扇区与 inode 扇区都从同一张空闲位图分配。

mod super_block;
pub use super_block::SuperBlock;

mod bitmap;
pub use bitmap::Bitmap;

mod disk_inode;
pub use disk_inode::{DiskInode, InodeKind, DIRECT_COUNT};

mod dir_entry;
pub use dir_entry::DirEntry;
