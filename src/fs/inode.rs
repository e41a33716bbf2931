//! 内存中的 inode 句柄
//!
//! DiskInode 放在磁盘上固定的扇区, 而 Inode 是放在内存中的句柄.
//! 同一个扇区的所有句柄共享 inode 表中的一项 (引用计数, 删除标记, 目录锁);
//! 句柄被 drop 时即关闭一次, 最后一个关闭者负责回收已删除 inode 的扇区.

use std::{fmt, sync::Arc};

use log::warn;
use spin::MutexGuard;

use super::{
    fs::InodeShared, get_block_cache, DiskInode, DiskInodeType, FileSystem, FsError, Result,
    MAX_FILE_SIZE,
};

pub struct Inode {
    /// inode 所在的扇区, 即 inumber
    sector: u32,
    shared: Arc<InodeShared>,
    fs: Arc<FileSystem>,
}

impl Inode {
    pub(crate) fn new(sector: u32, shared: Arc<InodeShared>, fs: Arc<FileSystem>) -> Self {
        Self { sector, shared, fs }
    }

    /// 在调用者已经分配好的 sector 上写入一个新的磁盘 inode, 并为 length 字节的内容分配清零的数据块.
    /// 分配失败时 sector 上的内容保持不变
    pub fn create(
        fs: &FileSystem,
        sector: u32,
        length: usize,
        kind: DiskInodeType,
        parent: u32,
    ) -> Result<()> {
        if length > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let blocks = fs.alloc_data(DiskInode::total_blocks(length as u32) as usize)?;
        get_block_cache(sector as usize, Arc::clone(&fs.block_device))
            .write()
            .modify(0, |disk_inode: &mut DiskInode| {
                disk_inode.initialize(kind, parent);
                disk_inode.increase_size(length as u32, blocks, &fs.block_device);
            });
        Ok(())
    }

    /// 在磁盘 inode 上调用一个函数来读取它
    fn read_disk_inode<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        get_block_cache(self.sector as usize, Arc::clone(&self.fs.block_device))
            .read()
            .read(0, f)
    }

    /// 在磁盘 inode 上调用一个函数来修改它
    fn modify_disk_inode<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        get_block_cache(self.sector as usize, Arc::clone(&self.fs.block_device))
            .write()
            .modify(0, f)
    }

    /// 从 offset 开始读, 读到文件末尾为止; 返回实际读到的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.read_disk_inode(|disk_inode| disk_inode.read_at(offset, buf, &self.fs.block_device))
    }

    /// 从 offset 开始写, 超出文件长度时自动扩容.
    /// 扩容失败时文件保持原来的长度, 只写入原长度之内能放下的前缀, 返回实际写入的字节数
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let Some(end) = offset.checked_add(buf.len()) else {
            warn!(
                "inode {}: write at offset {}: {}",
                self.sector,
                offset,
                FsError::FileTooLarge
            );
            return 0;
        };
        self.modify_disk_inode(|disk_inode| {
            if end > disk_inode.size as usize {
                if let Err(err) = self.increase_size(end, disk_inode) {
                    warn!(
                        "inode {}: cannot grow from {} to {} bytes: {}",
                        self.sector, disk_inode.size, end, err
                    );
                }
            }
            disk_inode.write_at(offset, buf, &self.fs.block_device)
        })
    }

    fn increase_size(&self, new_size: usize, disk_inode: &mut DiskInode) -> Result<()> {
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let needed = disk_inode.blocks_num_needed(new_size as u32);
        let blocks = self.fs.alloc_data(needed as usize)?;
        disk_inode.increase_size(new_size as u32, blocks, &self.fs.block_device);
        Ok(())
    }

    /// 标记删除. 扇区要等到最后一个句柄关闭时才回收
    pub fn remove(&self) {
        self.fs.mark_removed(self.sector);
    }

    pub fn is_removed(&self) -> bool {
        self.fs.is_removed(self.sector)
    }

    pub fn is_dir(&self) -> bool {
        self.read_disk_inode(|disk_inode| disk_inode.is_dir())
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> usize {
        self.read_disk_inode(|disk_inode| disk_inode.size as usize)
    }

    /// 所在目录的 inumber
    pub fn parent(&self) -> u32 {
        self.read_disk_inode(|disk_inode| disk_inode.parent)
    }

    /// 这个 inode 拥有的全部扇区: 自身所在扇区, 数据块与索引块
    pub fn sectors(&self) -> Vec<u32> {
        let mut sectors = vec![self.sector];
        sectors.extend(self.read_disk_inode(|disk_inode| disk_inode.blocks(&self.fs.block_device)));
        sectors
    }

    /// 再打开一次同一个 inode
    pub fn reopen(&self) -> Inode {
        self.fs.open_inode(self.sector)
    }

    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub(crate) fn dir_lock(&self) -> MutexGuard<'_, ()> {
        self.shared.dir_lock.lock()
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.reopen()
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        self.fs.close_inode(self.sector);
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode").field("sector", &self.sector).finish()
    }
}
