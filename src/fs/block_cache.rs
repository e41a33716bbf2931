//! 块缓存层: 在内存中缓存扇区的数据, 避免频繁读写磁盘
//!
//! 先通过 read_block 将一个扇区上的数据从磁盘读到内存中的一个缓冲区 [`BlockCache`] 中,
//! 后续对这个扇区的访问都在内存中完成; 缓冲区被修改过的话, 在被替换出去或者
//! 显式同步 ([`block_cache_sync_all`]) 的时候才通过 write_block 写回磁盘 (write-back).
//!
//! 所有缓冲区统一由全局管理器 [`BlockCacheManager`] 管理.
//! 对同一个扇区的所有访问都落在同一个缓冲区上, 因此一次 modify 之后的 read 一定能看到修改 (一致性).
//! 每个缓冲区由一把读写锁保护: 同一扇区的并发读可以并行, 写则与其他读写互斥, 不会读到写了一半的数据.
//!
//! 管理器以 (设备, 扇区号) 作为键, 因此可以同时挂载多个设备而不会互相串扰.

use std::{collections::VecDeque, sync::Arc};

use lazy_static::*;
use log::trace;
use spin::{Mutex, RwLock};

use super::{BlockDevice, BLOCK_CACHE_SIZE, BLOCK_SIZE};

/// 扇区缓冲区, 按 8 字节对齐, 以便把其中的内容直接解释为磁盘上的数据结构
#[repr(C, align(8))]
struct CacheData([u8; BLOCK_SIZE]);

/// Cached block inside memory
pub struct BlockCache {
    /// 位于内存中的缓冲区, 恰好为一个扇区
    cache: CacheData,
    /// 这个缓冲区来自于磁盘中的哪个扇区
    block_id: usize,
    /// 底层块设备的引用, 可通过它进行块读写
    block_device: Arc<dyn BlockDevice>,
    /// 从磁盘载入之后有没有被修改过
    modified: bool,
}

impl BlockCache {
    /// 创建一个 BlockCache: 这将触发一次 read_block (read-through)
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        let mut cache = CacheData([0u8; BLOCK_SIZE]);
        block_device.read_block(block_id, &mut cache.0);
        Self {
            cache,
            block_id,
            block_device,
            modified: false,
        }
    }

    /// 得到缓冲区中指定偏移量 offset 的字节地址
    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache.0[offset] as *const u8 as usize
    }

    /// 获取缓冲区中位于偏移量 offset 的一个类型为 T 的磁盘上数据结构的不可变引用.
    /// 返回的引用的生命周期不超过 BlockCache 自身.
    pub fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        // 确认 T 被整个包含在扇区及其缓冲区之内
        assert!(offset + type_size <= BLOCK_SIZE);
        let addr = self.addr_of_offset(offset);
        assert_eq!(addr % std::mem::align_of::<T>(), 0);
        unsafe { &*(addr as *const T) }
    }

    /// 获取可变引用, 同时将缓冲区标记为脏
    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        assert_eq!(addr % std::mem::align_of::<T>(), 0);
        unsafe { &mut *(addr as *mut T) }
    }

    // read/modify 构成了闭包 f 的执行环境, 让它绑定到一个缓冲区上执行, 返回值与 f 相同.

    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    /// If modified, write back to disk.
    pub fn sync(&mut self) {
        if self.modified {
            self.block_device.write_block(self.block_id, &self.cache.0);
            self.modified = false;
        }
    }
}

impl Drop for BlockCache {
    /// 缓冲区被替换出去时, 若被修改过则写回磁盘
    fn drop(&mut self) {
        self.sync();
    }
}

/// 设备的身份: 设备对象的地址.
/// 只要还有缓冲区引用着这个设备, 这个地址就不会被别的设备复用.
fn device_key(block_device: &Arc<dyn BlockDevice>) -> usize {
    Arc::as_ptr(block_device) as *const () as usize
}

type CacheEntry = (usize, usize, Arc<RwLock<BlockCache>>);

/// 块缓存全局管理器
///
/// 要对一个扇区进行读写时, 首先看它是否已经被载入到内存中了, 是则直接返回,
/// 否则先从磁盘读入. 若驻留的缓冲区数量已满, 则按类 FIFO 的策略替换掉一个没有在使用的缓冲区.
pub struct BlockCacheManager {
    /// (设备, 扇区号, 缓冲区) 的队列, 队头最早加入
    queue: VecDeque<CacheEntry>,
}

impl BlockCacheManager {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// 尝试从管理器中获取 block_device 上编号为 block_id 的扇区的缓冲区,
    /// 如果找不到, 会从磁盘读取到内存中, 还有可能会发生缓存替换
    pub fn get_block_cache(
        &mut self,
        block_id: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> Arc<RwLock<BlockCache>> {
        let key = device_key(&block_device);
        if let Some((_, _, cache)) = self
            .queue
            .iter()
            .find(|(dev, id, _)| *dev == key && *id == block_id)
        {
            return Arc::clone(cache);
        }

        if self.queue.len() >= BLOCK_CACHE_SIZE {
            // 从队头遍历到队尾, 找到第一个强引用计数恰好为 1 (即只有管理器自己持有) 的缓冲区替换出去
            if let Some(idx) = self
                .queue
                .iter()
                .position(|(_, _, cache)| Arc::strong_count(cache) == 1)
            {
                if let Some((_, victim, _)) = self.queue.remove(idx) {
                    trace!("block cache: evict sector {}", victim);
                }
            } else {
                // 上限足够大的话这不会发生: 同时被钉住的扇区数远小于 BLOCK_CACHE_SIZE
                panic!("Run out of BlockCache");
            }
        }

        let block_cache = Arc::new(RwLock::new(BlockCache::new(
            block_id,
            Arc::clone(&block_device),
        )));
        self.queue.push_back((key, block_id, Arc::clone(&block_cache)));
        block_cache
    }

    /// 当前驻留的 (设备, 扇区号) 快照. 只记下键, 不钉住任何缓冲区
    fn resident_keys(&self, key: Option<usize>) -> Vec<(usize, usize)> {
        self.queue
            .iter()
            .filter(|(dev, _, _)| key.map_or(true, |key| *dev == key))
            .map(|(dev, id, _)| (*dev, *id))
            .collect()
    }

    /// 只查找, 不载入: 已经被替换出去的缓冲区在被 drop 时就写回过了
    fn lookup(&self, dev: usize, block_id: usize) -> Option<Arc<RwLock<BlockCache>>> {
        self.queue
            .iter()
            .find(|(d, id, _)| *d == dev && *id == block_id)
            .map(|(_, _, cache)| Arc::clone(cache))
    }
}

impl Default for BlockCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref BLOCK_CACHE_MANAGER: Mutex<BlockCacheManager> =
        Mutex::new(BlockCacheManager::new());
}

/// 获取扇区的缓冲区. 调用者通过 `.read()` / `.write()` 拿到读写锁之后,
/// 再用 BlockCache::read/modify 访问缓冲区里的磁盘数据结构.
pub fn get_block_cache(
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
) -> Arc<RwLock<BlockCache>> {
    BLOCK_CACHE_MANAGER
        .lock()
        .get_block_cache(block_id, block_device)
}

/// 依次写回 keys 对应的缓冲区. 每次只钉住一个, 其余的在此期间照常可以被替换
fn sync_keys(keys: Vec<(usize, usize)>) {
    for (dev, block_id) in keys {
        let cache = BLOCK_CACHE_MANAGER.lock().lookup(dev, block_id);
        if let Some(cache) = cache {
            cache.write().sync();
        }
    }
}

/// 将所有设备上的脏缓冲区写回磁盘
pub fn block_cache_sync_all() {
    // 先在管理器锁内记下键再逐个写回, 避免持有管理器锁去等扇区锁
    let keys = BLOCK_CACHE_MANAGER.lock().resident_keys(None);
    sync_keys(keys);
}

/// 只写回 block_device 的脏缓冲区 (卸载时使用)
pub fn block_cache_sync_device(block_device: &Arc<dyn BlockDevice>) {
    let keys = BLOCK_CACHE_MANAGER
        .lock()
        .resident_keys(Some(device_key(block_device)));
    sync_keys(keys);
}
