//! Free-Map: 整个设备上每个扇区对应一个 bit 的位图, 1 意味着空闲, 0 意味着已经分配出去
//!
//! 位图常驻内存, 以 u64 为一组进行扫描: 找到一个不为全 0 的组, 再用
//! trailing_zeros 找到组内最低的空闲位. 挂载时从 Free-Map 文件中载入, 卸载时写回.
//!
//! 分配与回收是唯二修改位图的操作, 由一把自旋锁保护, 因此两个调用者不会拿到同一个扇区.

use log::warn;
use spin::Mutex;

use super::{FsError, Result, BLOCK_BITS, BLOCK_SIZE, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// 位图在 Free-Map 文件中的存储单位, 恰好占用一个扇区:
/// 64 个 u64, 即 64 * 64 = 4096 bits = 512 bytes
type BitmapBlock = [u64; 64];

pub struct FreeMap {
    /// 每个 u64 打包了 64 个扇区的状态, 超出设备范围的位恒为 0
    bits: Mutex<Vec<u64>>,
    /// 设备的扇区总数
    total: usize,
}

impl FreeMap {
    /// 除保留扇区 (Free-Map 文件与根目录的 inode) 外全部空闲的位图
    pub fn create(total: usize) -> Self {
        assert!(total > ROOT_DIR_SECTOR as usize, "device too small");
        let free_map = Self::all_free(total);
        {
            let mut bits = free_map.bits.lock();
            for sector in [FREE_MAP_SECTOR, ROOT_DIR_SECTOR] {
                let (group, inner) = decomposition(sector as usize);
                bits[group] &= !(1u64 << inner);
            }
        }
        free_map
    }

    fn all_free(total: usize) -> Self {
        let mut bits = vec![u64::MAX; (total + 63) / 64];
        let tail = total % 64;
        if tail != 0 {
            if let Some(last) = bits.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self {
            bits: Mutex::new(bits),
            total,
        }
    }

    /// 分配一个扇区, 返回扇区号
    pub fn alloc_one(&self) -> Result<u32> {
        let mut bits = self.bits.lock();
        if let Some((group, inner)) = bits
            .iter()
            .enumerate()
            // 不是全 0 的组里面至少有一个空闲位
            .find(|(_, bits64)| **bits64 != 0)
            .map(|(group, bits64)| (group, bits64.trailing_zeros() as usize))
        {
            bits[group] &= !(1u64 << inner);
            Ok((group * 64 + inner) as u32)
        } else {
            warn!("free map: out of sectors");
            Err(FsError::NoSpace)
        }
    }

    /// 分配 count 个连续的扇区, 返回第一个扇区号 (first fit)
    pub fn alloc_run(&self, count: usize) -> Result<u32> {
        assert!(count > 0);
        let mut bits = self.bits.lock();
        let mut run_start = 0;
        let mut run_len = 0;
        for sector in 0..self.total {
            let (group, inner) = decomposition(sector);
            if bits[group] & (1u64 << inner) == 0 {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = sector;
            }
            run_len += 1;
            if run_len == count {
                for sector in run_start..run_start + count {
                    let (group, inner) = decomposition(sector);
                    bits[group] &= !(1u64 << inner);
                }
                return Ok(run_start as u32);
            }
        }
        Err(FsError::NoSpace)
    }

    /// 分配 count 个不要求连续的扇区. 要么全部成功, 要么位图保持不变.
    pub fn alloc_many(&self, count: usize) -> Result<Vec<u32>> {
        let mut bits = self.bits.lock();
        let free: usize = bits.iter().map(|bits64| bits64.count_ones() as usize).sum();
        if free < count {
            warn!("free map: want {} sectors, only {} free", count, free);
            return Err(FsError::NoSpace);
        }
        let mut sectors = Vec::with_capacity(count);
        for (group, bits64) in bits.iter_mut().enumerate() {
            while *bits64 != 0 && sectors.len() < count {
                let inner = bits64.trailing_zeros() as usize;
                *bits64 &= !(1u64 << inner);
                sectors.push((group * 64 + inner) as u32);
            }
            if sectors.len() == count {
                break;
            }
        }
        Ok(sectors)
    }

    /// 回收从 sector 开始的 count 个扇区. 重复回收是程序错误.
    pub fn release(&self, sector: u32, count: usize) {
        let mut bits = self.bits.lock();
        for sector in sector as usize..sector as usize + count {
            assert!(sector < self.total, "release sector {} out of range", sector);
            let (group, inner) = decomposition(sector);
            assert!(
                bits[group] & (1u64 << inner) == 0,
                "double free of sector {}",
                sector
            );
            bits[group] |= 1u64 << inner;
        }
    }

    pub fn is_free(&self, sector: u32) -> bool {
        let (group, inner) = decomposition(sector as usize);
        (sector as usize) < self.total && self.bits.lock()[group] & (1u64 << inner) != 0
    }

    pub fn free_count(&self) -> usize {
        self.bits
            .lock()
            .iter()
            .map(|bits64| bits64.count_ones() as usize)
            .sum()
    }

    /// 获取可分配扇区的总数
    pub fn maximum(&self) -> usize {
        self.total
    }

    /// 位图的一份拷贝
    pub fn snapshot(&self) -> Vec<u64> {
        self.bits.lock().clone()
    }

    /// Free-Map 文件的字节数: 覆盖 total 个扇区所需的整块 BitmapBlock
    pub fn file_size(total: usize) -> usize {
        (total + BLOCK_BITS - 1) / BLOCK_BITS * core::mem::size_of::<BitmapBlock>()
    }

    /// 序列化为 Free-Map 文件的内容 (小端)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self
            .bits
            .lock()
            .iter()
            .flat_map(|bits64| bits64.to_le_bytes())
            .collect();
        bytes.resize(Self::file_size(self.total), 0);
        bytes
    }

    /// 从 Free-Map 文件的内容恢复位图
    pub fn from_bytes(total: usize, bytes: &[u8]) -> Result<Self> {
        let groups = (total + 63) / 64;
        if bytes.len() < groups * 8 {
            return Err(FsError::InvalidImage);
        }
        let bits = bytes
            .chunks_exact(8)
            .take(groups)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect();
        Ok(Self {
            bits: Mutex::new(bits),
            total,
        })
    }
}

/// 将扇区号分解为组编号与组内编号
fn decomposition(bit: usize) -> (usize, usize) {
    (bit / 64, bit % 64)
}

// 一个 BitmapBlock 恰好填满一个扇区
const _: () = assert!(core::mem::size_of::<BitmapBlock>() == BLOCK_SIZE);
