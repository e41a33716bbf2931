//! 路径语法: 以 `/` 分隔的若干分量, 以 `/` 开头的是绝对路径, 否则相对于当前目录.
//! 连续的 `/` 视为一个

use super::{FsError, Result, NAME_LENGTH_LIMIT};

/// 将路径拆分为 (父路径, 叶子名).
///
/// 以 `/` 结尾的路径叶子名为空, 表示"父路径所指的目录本身".
/// 父路径为空串表示当前目录
pub fn parse(path: &str) -> Result<(&str, &str)> {
    if path.is_empty() {
        return Err(FsError::InvalidPath);
    }
    Ok(match path.rfind('/') {
        None => ("", path),
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
    })
}

/// 路径中所有非空的分量
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|component| !component.is_empty())
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// 检查一个将要写入目录项的名字
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidPath);
    }
    if name.len() > NAME_LENGTH_LIMIT {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}
