use core::fmt::{self, Display, Formatter};

/// 文件系统向调用者报告的所有可恢复错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 路径中的某一级或叶子不存在
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// Free-Map 中找不到足够的空闲扇区
    NoSpace,
    NameTooLong,
    /// 空路径或非法的路径分量
    InvalidPath,
    FileTooLarge,
    /// 挂载的镜像不是本文件系统格式化出来的
    InvalidImage,
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "file exists",
            FsError::NotADirectory => "not a directory",
            FsError::IsADirectory => "is a directory",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::NoSpace => "no space left on device",
            FsError::NameTooLong => "file name too long",
            FsError::InvalidPath => "invalid path",
            FsError::FileTooLarge => "file too large",
            FsError::InvalidImage => "not a valid file system image",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;
