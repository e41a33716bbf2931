use crate::fs::{BlockDevice, BLOCK_SIZE};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

// std::fs::File 可以访问宿主机上的一个文件.
// 我们将它包装成 BlockFile 类型来模拟一块磁盘 (磁盘镜像), 为它实现 BlockDevice 接口.
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的,
// 在访问一个特定的块的时候, 我们必须先 seek 到这个块的开头位置

pub struct BlockFile(pub Mutex<File>);

impl BlockFile {
    /// 新建 (或截断) 一个容量为 num_blocks 个扇区的镜像文件
    pub fn create<P: AsRef<Path>>(path: P, num_blocks: usize) -> io::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.set_len((num_blocks * BLOCK_SIZE) as u64)?;
        Ok(Self(Mutex::new(f)))
    }

    /// 打开一个已有的镜像文件
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let f = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self(Mutex::new(f)))
    }
}

impl BlockDevice for BlockFile {
    /// 读取一个块从文件
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().expect("block file poisoned");
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        file.read_exact(buf).expect("Not a complete block");
    }

    /// 写一个块到文件
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().expect("block file poisoned");
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        file.write_all(buf).expect("Not a complete block");
    }

    fn num_blocks(&self) -> usize {
        let file = self.0.lock().expect("block file poisoned");
        file.metadata().map_or(0, |meta| meta.len() as usize / BLOCK_SIZE)
    }
}

/// 内存中的磁盘, 测试用
pub struct RamDisk {
    data: spin::Mutex<Vec<u8>>,
    num_blocks: usize,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            data: spin::Mutex::new(vec![0u8; num_blocks * BLOCK_SIZE]),
            num_blocks,
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert!(block_id < self.num_blocks, "sector {} out of range", block_id);
        let start = block_id * BLOCK_SIZE;
        buf.copy_from_slice(&self.data.lock()[start..start + BLOCK_SIZE]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert!(block_id < self.num_blocks, "sector {} out of range", block_id);
        let start = block_id * BLOCK_SIZE;
        self.data.lock()[start..start + BLOCK_SIZE].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}
