//! 打开的文件: inode 句柄加上一个读写位置.
//! 目录也通过 File 打开, 此时位置用于 readdir

use log::error;

use super::{Dir, Inode, Result};

pub struct File {
    inode: Inode,
    pos: usize,
}

impl File {
    pub fn open(inode: Inode) -> Self {
        Self { inode, pos: 0 }
    }

    /// 从当前位置读, 返回读到的字节数; 0 表示到达文件末尾
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(self.pos, buf);
        self.pos += n;
        n
    }

    /// 从当前位置写, 返回写入的字节数 (扩容失败时可能小于 buf.len())
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.write_at(self.pos, buf);
        self.pos += n;
        n
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.inode.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        // 目录的内容只能通过目录项操作修改
        if self.inode.is_dir() {
            error!("write to directory inode {}", self.inode.inumber());
            return 0;
        }
        self.inode.write_at(offset, buf)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// 读出下一个目录项的名字; 到达末尾时返回 None.
    /// 对普通文件调用返回 NotADirectory
    pub fn readdir(&mut self) -> Result<Option<String>> {
        let dir = Dir::open(self.inode.reopen())?;
        Ok(dir.read_entry_at(self.pos).map(|(name, next)| {
            self.pos = next;
            name
        }))
    }
}
