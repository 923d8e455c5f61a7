/// 目录与 inode 操作的失败原因
///
/// 只有帧池耗尽那样的致命情况才 panic，其余失败都返回给调用者，
/// 由上层（通常是系统调用层）决定如何呈现。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    AlreadyExists,
    NotFound,
    DirectoryNotEmpty,
    /// 目录还有别的打开句柄，不能删除
    DirectoryInUse,
    /// 名字为空、含`/`或为`.`/`..`
    InvalidName,
    NameTooLong,
    /// 空闲扇区耗尽或对象大小达到上限
    NoSpace,
}
