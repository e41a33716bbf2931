//! 磁盘数据结构层: [`DiskInode`] 与 [`DirEntry`]
//!
//! 磁盘布局:
//!
//! - 扇区 0 是 Free-Map 文件的 inode, 它的数据就是整个设备的空闲位图
//! - 扇区 1 是根目录的 inode
//! - 其余扇区按需分配, 或者作为某个文件/目录的 inode, 或者作为数据块/索引块
//!
//! 每个 inode 恰好占用一个扇区, inode 所在的扇区号 (inumber) 就是它的唯一标识.

use std::sync::Arc;

use super::{
    get_block_cache, BlockDevice, BLOCK_SIZE, DIRENT_SIZE, INDIRECT1_BOUND, INDIRECT2_BOUND,
    INODE_DIRECT_COUNT, INODE_INDIRECT1_COUNT, INODE_MAGIC, NAME_LENGTH_LIMIT,
};

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DiskInodeType {
    File,
    Directory,
}

impl DiskInodeType {
    fn to_raw(self) -> u32 {
        match self {
            DiskInodeType::File => 0,
            DiskInodeType::Directory => 1,
        }
    }
}

/// 索引块 IndirectBlock 实质上是一个 u32 数组, 每个都指向一个下一级索引块或者数据块
type IndirectBlock = [u32; BLOCK_SIZE / 4];

/// 文件的内容只是一个字节序列, 每个保存内容的数据块都只是一个字节数组
type DataBlock = [u8; BLOCK_SIZE];

/// 每个 文件/目录 在磁盘上均以一个 DiskInode 的形式存储, 大小恰好为一个扇区:
/// (4 + 122 + 2) * 4 = 512 B
#[repr(C)]
#[derive(Clone)]
pub struct DiskInode {
    /// 文件/目录内容的字节数
    pub size: u32,
    /// 0 为文件, 1 为目录
    type_: u32,
    /// 所在目录的 inode 扇区, 用于解析 `..`; 根目录指向自己
    pub parent: u32,
    magic: u32,
    /// 直接索引: 最多指向 INODE_DIRECT_COUNT 个数据块
    pub direct: [u32; INODE_DIRECT_COUNT],
    /// 一级间接索引块, 其中每个 u32 指向一个数据块
    pub indirect1: u32,
    /// 二级间接索引块, 其中每个 u32 指向一个一级索引块
    pub indirect2: u32,
}

impl DiskInode {
    pub fn initialize(&mut self, type_: DiskInodeType, parent: u32) {
        self.size = 0;
        self.type_ = type_.to_raw();
        self.parent = parent;
        self.magic = INODE_MAGIC;
        self.direct.iter_mut().for_each(|x| *x = 0);
        self.indirect1 = 0;
        self.indirect2 = 0;
    }

    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    pub fn kind(&self) -> DiskInodeType {
        if self.type_ == DiskInodeType::Directory.to_raw() {
            DiskInodeType::Directory
        } else {
            DiskInodeType::File
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == DiskInodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind() == DiskInodeType::File
    }

    /// 查到文件内部第 inner_id 个数据块在设备上的扇区号
    pub fn get_block_id(&self, inner_id: u32, block_device: &Arc<dyn BlockDevice>) -> u32 {
        let inner_id = inner_id as usize;
        if inner_id < INODE_DIRECT_COUNT {
            self.direct[inner_id]
        } else if inner_id < INDIRECT1_BOUND {
            get_block_cache(self.indirect1 as usize, Arc::clone(block_device))
                .read()
                .read(0, |indirect_block: &IndirectBlock| {
                    indirect_block[inner_id - INODE_DIRECT_COUNT]
                })
        } else {
            let last = inner_id - INDIRECT1_BOUND;
            // 先查二级索引块找到挂在它下面的一级子索引块, 再通过子索引块找到数据块
            let indirect1 = get_block_cache(self.indirect2 as usize, Arc::clone(block_device))
                .read()
                .read(0, |indirect2: &IndirectBlock| {
                    indirect2[last / INODE_INDIRECT1_COUNT]
                });
            get_block_cache(indirect1 as usize, Arc::clone(block_device))
                .read()
                .read(0, |indirect1: &IndirectBlock| {
                    indirect1[last % INODE_INDIRECT1_COUNT]
                })
        }
    }

    /// 容纳自身 size 字节的内容需要多少个数据块
    pub fn data_blocks(&self) -> u32 {
        Self::_data_blocks(self.size)
    }

    fn _data_blocks(size: u32) -> u32 {
        (size + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32
    }

    /// 容纳 size 字节需要的数据块与索引块总数
    pub fn total_blocks(size: u32) -> u32 {
        let data_blocks = Self::_data_blocks(size) as usize;
        let mut total = data_blocks;
        if data_blocks > INODE_DIRECT_COUNT {
            total += 1;
        }
        if data_blocks > INDIRECT1_BOUND {
            total += 1;
            // 二级索引的一级子索引
            total +=
                (data_blocks - INDIRECT1_BOUND - 1 + INODE_INDIRECT1_COUNT) / INODE_INDIRECT1_COUNT;
        }
        total as u32
    }

    /// 将 size 扩容到 new_size 需要额外多少个数据和索引块
    pub fn blocks_num_needed(&self, new_size: u32) -> u32 {
        assert!(new_size >= self.size);
        Self::total_blocks(new_size) - Self::total_blocks(self.size)
    }

    /// 扩容到 new_size.
    /// new_blocks 是本次扩容所需的全部块 (数据块与索引块), 由上层负责分配并清零, 数量恰为 blocks_num_needed.
    pub fn increase_size(
        &mut self,
        new_size: u32,
        new_blocks: Vec<u32>,
        block_device: &Arc<dyn BlockDevice>,
    ) {
        assert!(new_size as usize <= INDIRECT2_BOUND * BLOCK_SIZE);
        let mut current_blocks = self.data_blocks();
        self.size = new_size;
        let mut total_blocks = self.data_blocks();
        let mut new_blocks = new_blocks.into_iter();
        let mut next_block = move || new_blocks.next().expect("not enough blocks for growth");

        // 填充直接索引
        while current_blocks < total_blocks.min(INODE_DIRECT_COUNT as u32) {
            self.direct[current_blocks as usize] = next_block();
            current_blocks += 1;
        }

        // 分配一级索引
        if total_blocks > INODE_DIRECT_COUNT as u32 {
            if current_blocks == INODE_DIRECT_COUNT as u32 {
                self.indirect1 = next_block();
            }
            current_blocks -= INODE_DIRECT_COUNT as u32;
            total_blocks -= INODE_DIRECT_COUNT as u32;
        } else {
            return;
        }

        // 填充一级索引
        get_block_cache(self.indirect1 as usize, Arc::clone(block_device))
            .write()
            .modify(0, |indirect1: &mut IndirectBlock| {
                while current_blocks < total_blocks.min(INODE_INDIRECT1_COUNT as u32) {
                    indirect1[current_blocks as usize] = next_block();
                    current_blocks += 1;
                }
            });

        // 分配二级索引
        if total_blocks > INODE_INDIRECT1_COUNT as u32 {
            if current_blocks == INODE_INDIRECT1_COUNT as u32 {
                self.indirect2 = next_block();
            }
            current_blocks -= INODE_INDIRECT1_COUNT as u32;
            total_blocks -= INODE_INDIRECT1_COUNT as u32;
        } else {
            return;
        }

        // 填充二级索引: 从 (a0, b0) 走到 (a1, b1)
        let mut a0 = current_blocks as usize / INODE_INDIRECT1_COUNT;
        let mut b0 = current_blocks as usize % INODE_INDIRECT1_COUNT;
        let a1 = total_blocks as usize / INODE_INDIRECT1_COUNT;
        let b1 = total_blocks as usize % INODE_INDIRECT1_COUNT;

        get_block_cache(self.indirect2 as usize, Arc::clone(block_device))
            .write()
            .modify(0, |indirect2: &mut IndirectBlock| {
                while (a0 < a1) || (a0 == a1 && b0 < b1) {
                    if b0 == 0 {
                        indirect2[a0] = next_block();
                    }
                    get_block_cache(indirect2[a0] as usize, Arc::clone(block_device))
                        .write()
                        .modify(0, |indirect1: &mut IndirectBlock| {
                            indirect1[b0] = next_block();
                        });
                    b0 += 1;
                    if b0 == INODE_INDIRECT1_COUNT {
                        b0 = 0;
                        a0 += 1;
                    }
                }
            });
    }

    /// 这个 inode 占用的所有数据块与索引块 (不含 inode 自身所在的扇区)
    pub fn blocks(&self, block_device: &Arc<dyn BlockDevice>) -> Vec<u32> {
        let mut v: Vec<u32> = Vec::new();
        let mut data_blocks = self.data_blocks() as usize;

        v.extend_from_slice(&self.direct[..data_blocks.min(INODE_DIRECT_COUNT)]);
        if data_blocks <= INODE_DIRECT_COUNT {
            return v;
        }
        data_blocks -= INODE_DIRECT_COUNT;

        v.push(self.indirect1);
        get_block_cache(self.indirect1 as usize, Arc::clone(block_device))
            .read()
            .read(0, |indirect1: &IndirectBlock| {
                v.extend_from_slice(&indirect1[..data_blocks.min(INODE_INDIRECT1_COUNT)]);
            });
        if data_blocks <= INODE_INDIRECT1_COUNT {
            return v;
        }
        data_blocks -= INODE_INDIRECT1_COUNT;

        v.push(self.indirect2);
        let a1 = data_blocks / INODE_INDIRECT1_COUNT;
        let b1 = data_blocks % INODE_INDIRECT1_COUNT;
        let subs = get_block_cache(self.indirect2 as usize, Arc::clone(block_device))
            .read()
            .read(0, |indirect2: &IndirectBlock| {
                let mut subs: Vec<(u32, usize)> =
                    (0..a1).map(|i| (indirect2[i], INODE_INDIRECT1_COUNT)).collect();
                if b1 > 0 {
                    subs.push((indirect2[a1], b1));
                }
                subs
            });
        for (sub, count) in subs {
            v.push(sub);
            get_block_cache(sub as usize, Arc::clone(block_device))
                .read()
                .read(0, |indirect1: &IndirectBlock| {
                    v.extend_from_slice(&indirect1[..count]);
                });
        }
        v
    }

    /// 清空文件: 大小归零, 返回应回收的全部数据块与索引块
    pub fn clear_size(&mut self, block_device: &Arc<dyn BlockDevice>) -> Vec<u32> {
        let v = self.blocks(block_device);
        self.size = 0;
        self.direct.iter_mut().for_each(|x| *x = 0);
        self.indirect1 = 0;
        self.indirect2 = 0;
        v
    }

    /// 将文件内容从 offset 字节开始的部分读到 buf 中, 并返回实际读到的字节数.
    /// 读到文件末尾时返回的字节数会少于 buf.len()
    pub fn read_at(
        &self,
        offset: usize,
        buf: &mut [u8],
        block_device: &Arc<dyn BlockDevice>,
    ) -> usize {
        let mut start = offset;
        // offset 可能大得离谱, 饱和加法之后 start >= end, 什么也不做
        let end = offset.saturating_add(buf.len()).min(self.size as usize);
        if start >= end {
            return 0;
        }
        let mut start_block = start / BLOCK_SIZE;
        let mut read_size = 0usize;

        // 遍历位于字节区间 [start, end) 中间的那些块, 将其中的部分内容复制到 buf 中适当的区域
        loop {
            let end_current_block = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_read_size = end_current_block - start;
            let dst = &mut buf[read_size..read_size + block_read_size];
            get_block_cache(
                self.get_block_id(start_block as u32, block_device) as usize,
                Arc::clone(block_device),
            )
            .read()
            .read(0, |data_block: &DataBlock| {
                let src = &data_block[start % BLOCK_SIZE..start % BLOCK_SIZE + block_read_size];
                dst.copy_from_slice(src);
            });
            read_size += block_read_size;
            if end_current_block == end {
                break;
            }
            start_block += 1;
            start = end_current_block;
        }
        read_size
    }

    /// 将 buf 写入从 offset 开始的区间, 只写已经分配的范围 [0, size) 之内的部分.
    /// 需要扩容的话调用者应当先 increase_size
    pub fn write_at(
        &mut self,
        offset: usize,
        buf: &[u8],
        block_device: &Arc<dyn BlockDevice>,
    ) -> usize {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.size as usize);
        if start >= end {
            return 0;
        }
        let mut start_block = start / BLOCK_SIZE;
        let mut write_size = 0usize;

        loop {
            let end_current_block = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_write_size = end_current_block - start;
            get_block_cache(
                self.get_block_id(start_block as u32, block_device) as usize,
                Arc::clone(block_device),
            )
            .write()
            .modify(0, |data_block: &mut DataBlock| {
                let src = &buf[write_size..write_size + block_write_size];
                let dst =
                    &mut data_block[start % BLOCK_SIZE..start % BLOCK_SIZE + block_write_size];
                dst.copy_from_slice(src);
            });
            write_size += block_write_size;
            if end_current_block == end {
                break;
            }
            start_block += 1;
            start = end_current_block;
        }
        write_size
    }
}

/// 目录项
///
/// 目录的内容是一个目录项的序列, 每个目录项占据 32 字节, 每个扇区可以存储 16 个目录项.
/// 删除时只清除 in_use 标记 (墓碑), 之后新增的目录项可以复用这个槽位.
#[repr(C)]
pub struct DirEntry {
    /// 最大允许保存长度为 26 的文件/目录名 (数组 name 中最末的一个字节留给 '\0')
    name: [u8; NAME_LENGTH_LIMIT + 1],
    in_use: u8,
    inode_sector: u32,
}

impl DirEntry {
    /// 创建一个空的目录项
    pub fn create_empty() -> Self {
        Self {
            name: [0; NAME_LENGTH_LIMIT + 1],
            in_use: 0,
            inode_sector: 0,
        }
    }

    /// 通过文件名和 inode 扇区号创建一个正在使用的目录项.
    /// name 的长度由调用者保证不超过 NAME_LENGTH_LIMIT
    pub fn new(name: &str, inode_sector: u32) -> Self {
        assert!(name.len() <= NAME_LENGTH_LIMIT);
        let mut name_bytes = [0; NAME_LENGTH_LIMIT + 1];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: name_bytes,
            in_use: 1,
            inode_sector,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, DIRENT_SIZE) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut Self as *mut u8, DIRENT_SIZE) }
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn inode_sector(&self) -> u32 {
        self.inode_sector
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use != 0
    }

    /// 标记为墓碑
    pub fn tombstone(&mut self) {
        self.in_use = 0;
    }
}

const _: () = assert!(core::mem::size_of::<DiskInode>() == BLOCK_SIZE);
const _: () = assert!(core::mem::size_of::<DirEntry>() == DIRENT_SIZE);
