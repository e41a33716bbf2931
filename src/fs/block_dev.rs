//! 块设备仅支持以扇区为单位进行随机读写, 需要由具体的块设备驱动来实现这些方法.
//! 块缓存层会调用它们进行块缓存的管理, 上层从不直接访问设备.
//! 泛用性: 可以访问任何实现了 BlockDevice Trait 的块设备驱动程序.

use std::any::Any;

// 本文件系统中块与扇区大小相同 (BLOCK_SIZE), 因此两者在代码里混用.

/// 块设备接口层
///
/// 设备错误不向上传播: 驱动应在无法完成读写时直接 panic.
pub trait BlockDevice: Send + Sync + Any {
    /// 将编号为 block_id 的块从磁盘读入内存中的缓冲区 buf
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    /// 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的块
    fn write_block(&self, block_id: usize, buf: &[u8]);

    /// 设备的扇区总数
    fn num_blocks(&self) -> usize;
}
