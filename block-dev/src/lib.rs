//! # 块设备接口层
//!
//! 以扇区为单位读写存储设备的抽象。实现了 [`BlockDevice`] 的类型
//! 即为块设备驱动：内核里是 virtio 之类的驱动，宿主机上测试时
//! 则用一个普通文件模拟。
//!
//! 读写都是同步的，调用返回时数据已经到达（或来自）设备。

#![no_std]

use core::any::Any;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    /// 把`block_id`号块读入`buf`
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    /// 把`buf`写到`block_id`号块
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
