//! 目录: 内容为定长目录项序列的特殊文件
//!
//! 目录项被删除时只打上墓碑, 新增目录项优先复用第一个墓碑/空槽位, 没有才追加到末尾,
//! 因此 readdir 的顺序就是槽位的物理顺序.
//!
//! `.` 与 `..` 并不作为目录项存放: `.` 就是目录自身, `..` 取自 inode 中记录的父目录扇区.
//! 对目录内容的修改都在该目录的目录锁内完成, 两个并发的同名创建至多一个成功.

use std::sync::Arc;

use super::{
    path::check_name, DirEntry, DiskInodeType, FileSystem, FsError, Inode, Result, DIRENT_SIZE,
    ROOT_DIR_SECTOR,
};

pub struct Dir {
    inode: Inode,
    /// readdir 的位置 (字节偏移)
    pos: usize,
}

/// 从 offset 开始顺序扫描所有槽位 (包括墓碑), 返回第一个满足 pred 的槽位偏移与目录项
fn find_slot(
    inode: &Inode,
    mut offset: usize,
    mut pred: impl FnMut(usize, &DirEntry) -> bool,
) -> Option<(usize, DirEntry)> {
    let mut entry = DirEntry::create_empty();
    while inode.read_at(offset, entry.as_bytes_mut()) == DIRENT_SIZE {
        if pred(offset, &entry) {
            return Some((offset, entry));
        }
        offset += DIRENT_SIZE;
    }
    None
}

fn find_in_use(inode: &Inode, name: &str) -> Option<(usize, DirEntry)> {
    find_in_use_or(inode, name, |_| {})
}

/// 查找名为 name 的目录项, 途经的每个空闲槽位都交给 on_free
fn find_in_use_or(
    inode: &Inode,
    name: &str,
    mut on_free: impl FnMut(usize),
) -> Option<(usize, DirEntry)> {
    find_slot(inode, 0, |offset, entry| {
        if !entry.is_in_use() {
            on_free(offset);
            return false;
        }
        entry.name() == name
    })
}

/// 没有任何正在使用的目录项 (墓碑不算). 调用者需持有 inode 的目录锁
fn no_entries(inode: &Inode) -> bool {
    find_slot(inode, 0, |_, entry| entry.is_in_use()).is_none()
}

impl Dir {
    /// 在 sector 上创建一个能容纳 entry_count 个目录项的空目录
    pub fn create(fs: &FileSystem, sector: u32, entry_count: usize, parent: u32) -> Result<()> {
        Inode::create(
            fs,
            sector,
            entry_count * DIRENT_SIZE,
            DiskInodeType::Directory,
            parent,
        )
    }

    pub fn open(inode: Inode) -> Result<Self> {
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Self { inode, pos: 0 })
    }

    pub fn open_root(fs: &Arc<FileSystem>) -> Self {
        Self {
            inode: fs.open_inode(ROOT_DIR_SECTOR),
            pos: 0,
        }
    }

    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.reopen(),
            pos: 0,
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn into_inode(self) -> Inode {
        self.inode
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    pub fn parent_sector(&self) -> u32 {
        self.inode.parent()
    }

    /// 按名字查找, 返回打开的 inode
    pub fn lookup(&self, name: &str) -> Result<Inode> {
        if name != "." && name != ".." {
            check_name(name)?;
        }
        // 在目录锁内打开, 保证拿到的 inode 不会被并发的 remove 抢先回收.
        // 目录没被删除时它的目录项还在父目录里, 父目录非空, 因此 `..` 也不会被回收
        let _guard = self.inode.dir_lock();
        // 已被删除的目录里什么都找不到, 包括 `.` 与 `..`: 父目录可能早已回收
        if self.inode.is_removed() {
            return Err(FsError::NotFound);
        }
        match name {
            "." => return Ok(self.inode.reopen()),
            ".." => {
                return Ok(self
                    .inode
                    .file_system()
                    .open_inode(self.inode.parent()))
            }
            _ => {}
        }
        find_in_use(&self.inode, name)
            .map(|(_, entry)| self.inode.file_system().open_inode(entry.inode_sector()))
            .ok_or(FsError::NotFound)
    }

    /// 添加一个目录项 name -> inode_sector
    pub fn add(&self, name: &str, inode_sector: u32) -> Result<()> {
        if name == "." || name == ".." {
            return Err(FsError::AlreadyExists);
        }
        check_name(name)?;

        let _guard = self.inode.dir_lock();
        // 已经被删除的目录不能再往里面添加东西
        if self.inode.is_removed() {
            return Err(FsError::NotFound);
        }
        // 一趟扫描: 既检查重名, 也记下第一个可复用的槽位
        let mut free_slot = None;
        if find_in_use_or(&self.inode, name, |offset| {
            free_slot.get_or_insert(offset);
        })
        .is_some()
        {
            return Err(FsError::AlreadyExists);
        }
        let offset = free_slot.unwrap_or_else(|| self.inode.length());

        // 追加时扩容是全有或全无的: 失败则一个字节都不会写入, 目录保持原样
        let entry = DirEntry::new(name, inode_sector);
        if self.inode.write_at(offset, entry.as_bytes()) != DIRENT_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// 删除名为 name 的目录项, 并对目标 inode 标记删除.
    /// 目标是目录时必须为空
    pub fn remove(&self, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidPath);
        }
        check_name(name)?;

        let _guard = self.inode.dir_lock();
        let (offset, mut entry) = find_in_use(&self.inode, name).ok_or(FsError::NotFound)?;
        let target = self.inode.file_system().open_inode(entry.inode_sector());

        // 持有目标的目录锁直到它被标记删除, 期间不会有人在其中新建文件
        let _target_guard = if target.is_dir() {
            let guard = target.dir_lock();
            if !no_entries(&target) {
                return Err(FsError::DirectoryNotEmpty);
            }
            Some(guard)
        } else {
            None
        };

        entry.tombstone();
        assert_eq!(self.inode.write_at(offset, entry.as_bytes()), DIRENT_SIZE);
        target.remove();
        Ok(())
    }

    /// 除 `.` 与 `..` 外没有任何正在使用的目录项
    pub fn is_empty(&self) -> bool {
        let _guard = self.inode.dir_lock();
        no_entries(&self.inode)
    }

    /// 从 pos 开始找下一个正在使用的目录项, 返回它的名字与下一次开始的位置.
    /// 墓碑被跳过; 到达末尾时返回 None
    pub fn read_entry_at(&self, pos: usize) -> Option<(String, usize)> {
        let _guard = self.inode.dir_lock();
        find_slot(&self.inode, pos, |_, entry| entry.is_in_use())
            .map(|(offset, entry)| (String::from(entry.name()), offset + DIRENT_SIZE))
    }

    pub fn readdir(&mut self) -> Option<String> {
        let (name, next) = self.read_entry_at(self.pos)?;
        self.pos = next;
        Some(name)
    }

    /// 所有正在使用的目录项: (名字, inumber)
    pub fn entries(&self) -> Vec<(String, u32)> {
        let _guard = self.inode.dir_lock();
        let mut v = Vec::new();
        find_slot(&self.inode, 0, |_, entry| {
            if entry.is_in_use() {
                v.push((String::from(entry.name()), entry.inode_sector()));
            }
            false
        });
        v
    }

    /// 列出目录下的所有名字
    pub fn ls(&self) -> Vec<String> {
        self.entries().into_iter().map(|(name, _)| name).collect()
    }
}
