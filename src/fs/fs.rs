//! 文件系统卷: 块设备 + Free-Map + 打开中的 inode 表
//!
//! [`FileSystem`] 知道保留扇区所在的位置, 扇区的分配和回收也需要经过它才能完成,
//! 因此某种意义上讲它可以看成一个扇区管理器.
//!
//! 从这一层开始, 所有的数据结构放在内存上

use std::{collections::BTreeMap, sync::Arc};

use log::{debug, info};
use spin::Mutex;

use super::{
    block_cache_sync_device, get_block_cache, BlockDevice, Dir, DiskInode, DiskInodeType,
    FreeMap, FsError, Inode, Result, BLOCK_SIZE, DIRENTS_PER_BLOCK, FREE_MAP_SECTOR,
    ROOT_DIR_SECTOR,
};

type DataBlock = [u8; BLOCK_SIZE];

/// 同一个 inode 的所有句柄共享的内存状态
pub(crate) struct InodeShared {
    /// 串行化对目录内容的修改 (新增/删除目录项)
    pub(crate) dir_lock: Mutex<()>,
}

/// inode 表中的一项
struct OpenInode {
    open_count: usize,
    /// 已被删除但还有人打开着: 最后一个关闭者负责回收
    removed: bool,
    shared: Arc<InodeShared>,
}

pub struct FileSystem {
    /// 在进行后续操作的时候, 该指针会被拷贝并传递给下层的数据结构
    pub block_device: Arc<dyn BlockDevice>,
    pub free_map: FreeMap,
    /// 以 inumber 为键的打开 inode 表
    open_inodes: Mutex<BTreeMap<u32, OpenInode>>,
}

impl FileSystem {
    fn new(block_device: Arc<dyn BlockDevice>, free_map: FreeMap) -> Arc<Self> {
        Arc::new(Self {
            block_device,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        })
    }

    /// 在块设备上创建并初始化一个文件系统
    pub fn format(block_device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let total = block_device.num_blocks();
        info!("formatting file system: {} sectors", total);
        let fs = Self::new(block_device, FreeMap::create(total));

        // Free-Map 文件必须在根目录之前创建, 这样它的数据块总是紧跟在保留扇区之后
        Inode::create(
            &fs,
            FREE_MAP_SECTOR,
            FreeMap::file_size(total),
            DiskInodeType::File,
            FREE_MAP_SECTOR,
        )?;
        Dir::create(&fs, ROOT_DIR_SECTOR, DIRENTS_PER_BLOCK, ROOT_DIR_SECTOR)?;

        fs.sync();
        Ok(fs)
    }

    /// 从一个已经格式化过的块设备上打开文件系统
    pub fn open(block_device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let total = block_device.num_blocks();
        let read_record = |sector: u32| {
            get_block_cache(sector as usize, Arc::clone(&block_device))
                .read()
                .read(0, |disk_inode: &DiskInode| disk_inode.clone())
        };

        let root = read_record(ROOT_DIR_SECTOR);
        if !root.is_valid() || !root.is_dir() {
            return Err(FsError::InvalidImage);
        }
        let free_map_inode = read_record(FREE_MAP_SECTOR);
        if !free_map_inode.is_valid() {
            return Err(FsError::InvalidImage);
        }

        // 此时还没有 FileSystem, 直接通过磁盘 inode 读出位图
        let mut bytes = vec![0u8; free_map_inode.size as usize];
        free_map_inode.read_at(0, &mut bytes, &block_device);
        let free_map = FreeMap::from_bytes(total, &bytes)?;
        info!(
            "mounted file system: {} sectors, {} free",
            total,
            free_map.free_count()
        );
        Ok(Self::new(block_device, free_map))
    }

    /// 将 Free-Map 写回它的文件, 并把该设备的脏缓冲区写回磁盘
    pub fn sync(self: &Arc<Self>) {
        let bytes = self.free_map.to_bytes();
        let written = self.open_inode(FREE_MAP_SECTOR).write_at(0, &bytes);
        assert_eq!(written, bytes.len(), "free map file truncated");
        block_cache_sync_device(&self.block_device);
    }

    /// 打开 sector 上的 inode: 第一次打开时在表中建立一项, 之后只增加引用计数
    pub fn open_inode(self: &Arc<Self>, sector: u32) -> Inode {
        let shared = {
            let mut table = self.open_inodes.lock();
            let entry = table.entry(sector).or_insert_with(|| OpenInode {
                open_count: 0,
                removed: false,
                shared: Arc::new(InodeShared {
                    dir_lock: Mutex::new(()),
                }),
            });
            entry.open_count += 1;
            Arc::clone(&entry.shared)
        };
        Inode::new(sector, shared, Arc::clone(self))
    }

    /// 关闭一次; 最后一个关闭者若发现 inode 已被删除, 则回收它的全部扇区
    pub(crate) fn close_inode(&self, sector: u32) {
        let removed = {
            let mut table = self.open_inodes.lock();
            let Some(entry) = table.get_mut(&sector) else {
                return;
            };
            entry.open_count -= 1;
            if entry.open_count > 0 {
                return;
            }
            table.remove(&sector).map_or(false, |entry| entry.removed)
        };
        if removed {
            self.dealloc_inode(sector);
        }
    }

    pub(crate) fn mark_removed(&self, sector: u32) {
        if let Some(entry) = self.open_inodes.lock().get_mut(&sector) {
            entry.removed = true;
        }
    }

    pub(crate) fn is_removed(&self, sector: u32) -> bool {
        self.open_inodes
            .lock()
            .get(&sector)
            .map_or(false, |entry| entry.removed)
    }

    /// sector 当前被打开的次数
    pub fn open_count(&self, sector: u32) -> usize {
        self.open_inodes
            .lock()
            .get(&sector)
            .map_or(0, |entry| entry.open_count)
    }

    /// 先回收数据块与索引块, 最后回收 inode 自身所在的扇区
    fn dealloc_inode(&self, sector: u32) {
        let blocks = get_block_cache(sector as usize, Arc::clone(&self.block_device))
            .write()
            .modify(0, |disk_inode: &mut DiskInode| {
                disk_inode.clear_size(&self.block_device)
            });
        debug!("dealloc inode {}: {} blocks", sector, blocks.len());
        for block in blocks {
            self.free_map.release(block, 1);
        }
        self.free_map.release(sector, 1);
    }

    /// 分配 count 个清零过的扇区.
    /// 优先找一段连续的扇区, 碎片化严重时退化为逐个分配; 两种方式都是要么全部成功要么不分配
    pub fn alloc_data(&self, count: usize) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let blocks = match self.free_map.alloc_run(count) {
            Ok(first) => (first..first + count as u32).collect(),
            Err(_) => self.free_map.alloc_many(count)?,
        };
        for &block in blocks.iter() {
            get_block_cache(block as usize, Arc::clone(&self.block_device))
                .write()
                .modify(0, |data_block: &mut DataBlock| data_block.fill(0));
        }
        Ok(blocks)
    }

    pub fn total_sectors(&self) -> usize {
        self.free_map.maximum()
    }

    pub fn free_sectors(&self) -> usize {
        self.free_map.free_count()
    }
}
