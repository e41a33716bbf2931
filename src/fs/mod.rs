mod bitmap;
mod block_cache;
mod block_dev;
mod directory;
mod error;
mod file;
#[allow(clippy::module_inception)]
mod fs;
mod inode;
mod layout;
mod path;
mod vfs;

extern crate log;

/// Use a block size of 512 bytes
pub const BLOCK_SIZE: usize = 512;
/// 内存中同时驻留的扇区缓冲区数量上限 (所有设备共享)
pub const BLOCK_CACHE_SIZE: usize = 64;
/// 每个磁盘 inode 都带有的魔数, 用于挂载时的合法性检查
pub const INODE_MAGIC: u32 = 0x494e_4f44;
/// Free-Map 文件的 inode 所在扇区
pub const FREE_MAP_SECTOR: u32 = 0;
/// 根目录的 inode 所在扇区
pub const ROOT_DIR_SECTOR: u32 = 1;
/// The max number of direct pointers
pub const INODE_DIRECT_COUNT: usize = 122;
/// The max length of a directory entry name
pub const NAME_LENGTH_LIMIT: usize = 26;
/// The max number of indirect1 pointers
pub const INODE_INDIRECT1_COUNT: usize = BLOCK_SIZE / 4;
/// The max number of indirect2 pointers
pub const INODE_INDIRECT2_COUNT: usize = INODE_INDIRECT1_COUNT * INODE_INDIRECT1_COUNT;
/// The upper bound of direct index
pub const DIRECT_BOUND: usize = INODE_DIRECT_COUNT;
/// The upper bound of indirect1 index
pub const INDIRECT1_BOUND: usize = DIRECT_BOUND + INODE_INDIRECT1_COUNT;
/// The upper bound of indirect2 index
pub const INDIRECT2_BOUND: usize = INDIRECT1_BOUND + INODE_INDIRECT2_COUNT;
/// 单个文件的最大字节数
pub const MAX_FILE_SIZE: usize = INDIRECT2_BOUND * BLOCK_SIZE;
/// 块的 bit 数量
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 目录项的大小
pub const DIRENT_SIZE: usize = 32;
/// 一个扇区能放下的目录项个数, 新建目录的初始容量
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;

pub use bitmap::FreeMap;
pub use block_cache::{block_cache_sync_all, block_cache_sync_device, get_block_cache};
pub use block_dev::BlockDevice;
pub use directory::Dir;
pub use error::{FsError, Result};
pub use file::File;
pub use fs::FileSystem;
pub use inode::Inode;
pub use layout::*;
pub use path::{components, parse};
pub use vfs::{Context, Vfs};
