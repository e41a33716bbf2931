//! 一个带有多级目录的简单文件系统.
//!
//! 自底向上分为: 块设备接口, 块缓存, Free-Map, 磁盘数据结构, inode, 目录, 以及按路径操作的 [`Vfs`].
//! [`device`] 中提供了两种块设备: 宿主机上的镜像文件与内存盘.

pub mod device;
pub mod fs;

#[cfg(test)]
mod test;

pub use fs::*;
