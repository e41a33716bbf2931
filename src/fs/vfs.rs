//! 文件系统的对外接口.
//!
//! 使用者并不关心磁盘布局, 他们只想按路径操作目录树中的文件和目录.
//! [`Vfs`] 负责把路径解析成目录与叶子名, 再调用目录层与 inode 层完成操作.
//!
//! 相对路径相对于调用者的 [`Context`] (当前目录) 解析.
//! 每个执行上下文各持有一个 Context, 它只属于调用者自己, 不需要同步.

use std::sync::Arc;

use log::{debug, info};

use super::{
    path::{self, check_name},
    BlockDevice, Dir, DiskInodeType, File, FileSystem, FsError, Inode, Result,
    DIRENTS_PER_BLOCK, ROOT_DIR_SECTOR,
};

/// 执行上下文: 持有当前目录的一个打开的句柄.
/// 克隆 (例如 fork) 时会再打开一次当前目录
#[derive(Clone)]
pub struct Context {
    cwd: Inode,
}

impl Context {
    /// 当前目录的 inumber
    pub fn cwd(&self) -> u32 {
        self.cwd.inumber()
    }
}

pub struct Vfs {
    fs: Arc<FileSystem>,
}

/// 新建 inode 的进度: 已分配扇区 -> 已初始化 -> 已链接进目录
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    Allocated,
    Initialized,
    Committed,
}

/// 新建文件/目录时获得的资源. 没有走到 Committed 就被 drop 的话,
/// 按已经到达的阶段归还全部资源, Free-Map 与目录内容恢复原样
struct PendingInode<'a> {
    fs: &'a Arc<FileSystem>,
    sector: u32,
    stage: Stage,
}

impl<'a> PendingInode<'a> {
    fn alloc(fs: &'a Arc<FileSystem>) -> Result<Self> {
        let sector = fs.free_map.alloc_one()?;
        Ok(Self {
            fs,
            sector,
            stage: Stage::Allocated,
        })
    }
}

impl Drop for PendingInode<'_> {
    fn drop(&mut self) {
        match self.stage {
            Stage::Committed => {}
            Stage::Allocated => {
                debug!("rollback: release sector {}", self.sector);
                self.fs.free_map.release(self.sector, 1);
            }
            Stage::Initialized => {
                debug!("rollback: dealloc inode {}", self.sector);
                // 标记删除后立即关闭, 数据块与 inode 扇区随之回收
                self.fs.open_inode(self.sector).remove();
            }
        }
    }
}

impl Vfs {
    /// 挂载块设备上的文件系统; format 为真时先格式化
    pub fn init(block_device: Arc<dyn BlockDevice>, format: bool) -> Result<Self> {
        let fs = if format {
            FileSystem::format(block_device)?
        } else {
            FileSystem::open(block_device)?
        };
        Ok(Self { fs })
    }

    /// 卸载: 写回 Free-Map 与所有脏缓冲区
    pub fn done(self) {
        self.fs.sync();
        info!(
            "file system done: {} of {} sectors free",
            self.fs.free_sectors(),
            self.fs.total_sectors()
        );
    }

    /// 一个当前目录为根目录的新上下文
    pub fn context(&self) -> Context {
        Context {
            cwd: self.fs.open_inode(ROOT_DIR_SECTOR),
        }
    }

    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    /// 沿着 path 的每个分量逐级 lookup, 得到 path 所指的目录
    fn resolve_dir(&self, ctx: &Context, path: &str) -> Result<Dir> {
        let mut dir = if path::is_absolute(path) {
            Dir::open_root(&self.fs)
        } else {
            Dir::open(ctx.cwd.reopen())?
        };
        for component in path::components(path) {
            dir = Dir::open(dir.lookup(component)?)?;
        }
        Ok(dir)
    }

    /// 解析出叶子所在的目录与叶子名
    fn resolve<'p>(&self, ctx: &Context, path: &'p str) -> Result<(Dir, &'p str)> {
        let (parent, leaf) = path::parse(path)?;
        Ok((self.resolve_dir(ctx, parent)?, leaf))
    }

    /// 按路径打开文件或目录. 以 `/` 结尾的路径打开目录本身
    pub fn open(&self, ctx: &Context, path: &str) -> Result<File> {
        let (dir, leaf) = self.resolve(ctx, path)?;
        let inode = if leaf.is_empty() {
            dir.into_inode()
        } else {
            dir.lookup(leaf)?
        };
        Ok(File::open(inode))
    }

    /// 创建一个初始长度为 initial_size 字节 (内容全 0) 的普通文件
    pub fn create(&self, ctx: &Context, path: &str, initial_size: usize) -> Result<()> {
        self.create_inode(ctx, path, initial_size, DiskInodeType::File)
    }

    /// 创建一个空目录, 初始容量为一个扇区的目录项
    pub fn mkdir(&self, ctx: &Context, path: &str) -> Result<()> {
        self.create_inode(ctx, path, 0, DiskInodeType::Directory)
    }

    fn create_inode(
        &self,
        ctx: &Context,
        path: &str,
        initial_size: usize,
        kind: DiskInodeType,
    ) -> Result<()> {
        // 当前目录已经被删除了, 不能在其中 (或相对于它) 再创建任何东西
        if ctx.cwd.is_removed() {
            return Err(FsError::NotFound);
        }
        let (dir, leaf) = self.resolve(ctx, path)?;
        if leaf.is_empty() || leaf == "." || leaf == ".." {
            return Err(FsError::AlreadyExists);
        }
        check_name(leaf)?;

        let mut pending = PendingInode::alloc(&self.fs)?;
        match kind {
            DiskInodeType::Directory => {
                Dir::create(&self.fs, pending.sector, DIRENTS_PER_BLOCK, dir.inumber())?
            }
            DiskInodeType::File => Inode::create(
                &self.fs,
                pending.sector,
                initial_size,
                DiskInodeType::File,
                dir.inumber(),
            )?,
        }
        pending.stage = Stage::Initialized;
        dir.add(leaf, pending.sector)?;
        pending.stage = Stage::Committed;
        debug!("created {:?} {} at sector {}", kind, path, pending.sector);
        Ok(())
    }

    /// 删除文件或空目录. 仍被打开的 inode 要等到最后一次关闭才回收
    pub fn remove(&self, ctx: &Context, path: &str) -> Result<()> {
        let (dir, leaf) = self.resolve(ctx, path)?;
        if leaf.is_empty() {
            return Err(FsError::InvalidPath);
        }
        dir.remove(leaf)
    }

    /// 切换当前目录
    pub fn chdir(&self, ctx: &mut Context, path: &str) -> Result<()> {
        let file = self.open(ctx, path)?;
        let dir = Dir::open(file.inode().reopen())?;
        ctx.cwd = dir.into_inode();
        Ok(())
    }

    /// 读出目录句柄的下一个目录项名
    pub fn readdir(&self, file: &mut File) -> Result<Option<String>> {
        file.readdir()
    }

    pub fn is_dir(&self, file: &File) -> bool {
        file.is_dir()
    }

    pub fn inumber(&self, file: &File) -> u32 {
        file.inumber()
    }

    pub fn free_sectors(&self) -> usize {
        self.fs.free_sectors()
    }

    pub fn total_sectors(&self) -> usize {
        self.fs.total_sectors()
    }
}
