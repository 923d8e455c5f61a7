//! # 目录层
//!
//! 把目录 inode 的数据区解释为 [`DirEntry`] 槽位数组。
//! 同一 inode 的所有目录句柄共享 inode 身上的那把锁，改动槽位
//! （增删）与要求一致视图的扫描都在锁内完成；读取游标是每个
//! 句柄自己的。
//!
//! 路径解析逐级推进：查找孩子时只持当前父目录的锁，下潜前
//! 先放手，任意时刻至多持有一把 inode 锁，锁序死锁无从谈起
//! （唯一例外是删除子目录时父锁内套取子锁，方向恒为自上而下）。

use alloc::string::String;
use alloc::sync::Arc;

use crate::inode::Inode;
use crate::layout::{DirEntry, InodeKind};
use crate::rfs::ReedFileSystem;
use crate::sector::SectorId;
use crate::{Error, NAME_MAX, ROOT_SECTOR};

/// 打开的目录
#[derive(Debug)]
pub struct Dir {
    inode: Arc<Inode>,
    /// 读取游标（字节偏移），开门就跳过`.`与`..`
    pos: usize,
}

/// 路径里最后一个`/`之后的部分；没有`/`则是整个路径
pub fn parse_filename(filepath: &str) -> &str {
    filepath
        .rsplit_once('/')
        .map_or(filepath, |(_, filename)| filename)
}

impl Dir {
    /// 在`sector`建一个空目录，写好指向自己的`.`和指向`parent`的
    /// `..`。根目录的`..`就是它自己。
    pub fn create(
        fs: &Arc<ReedFileSystem>,
        sector: SectorId,
        parent: SectorId,
    ) -> Result<(), Error> {
        Inode::create(fs, sector, InodeKind::Directory);
        let inode = Inode::open(fs, sector).ok_or(Error::NotFound)?;

        let dot = DirEntry::new(".", sector);
        let dotdot = DirEntry::new("..", parent);
        if inode.write_at(0, dot.as_bytes()) != DirEntry::SIZE
            || inode.write_at(DirEntry::SIZE, dotdot.as_bytes()) != DirEntry::SIZE
        {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// 接管`inode`并打开为目录。不是目录则返回空，
    /// `inode`随即关闭。
    pub fn open(inode: Arc<Inode>) -> Option<Dir> {
        inode.is_dir().then_some(Dir {
            inode,
            pos: 2 * DirEntry::SIZE,
        })
    }

    /// 打开根目录
    pub fn open_root(fs: &Arc<ReedFileSystem>) -> Option<Dir> {
        Inode::open(fs, ROOT_SECTOR).and_then(Dir::open)
    }

    /// 同一 inode 的新句柄，游标独立
    pub fn reopen(&self) -> Dir {
        Dir {
            inode: self.inode.reopen(),
            pos: 2 * DirEntry::SIZE,
        }
    }

    /// 打开`filepath`所指文件的父目录。
    ///
    /// 绝对路径从根出发，相对路径从`cwd`出发（内部重开，返回的
    /// 句柄与`cwd`无关）。连续的`/`合并；以`/`结尾、中间某级查无
    /// 此名或超长都让整个解析失败。
    pub fn open_dirs(fs: &Arc<ReedFileSystem>, filepath: &str, cwd: &Dir) -> Option<Dir> {
        let mut rest = filepath;
        let mut parent = match filepath.strip_prefix('/') {
            Some(stripped) => {
                rest = stripped;
                Self::open_root(fs)?
            }
            None => cwd.reopen(),
        };

        while let Some((component, tail)) = rest.split_once('/') {
            // 以`/`收尾的路径不指称文件
            if tail.is_empty() {
                return None;
            }
            // 连续的`/`
            if component.is_empty() {
                rest = tail;
                continue;
            }
            if component.len() > NAME_MAX {
                return None;
            }

            // 查找这一跳只握父目录的锁，下潜前释放
            let child = {
                let _dir_lock = parent.inode.dir_lock().lock();
                parent
                    .lookup_entry(component)
                    .and_then(|(entry, _)| Inode::open(fs, entry.inode_sector()))
            }?;
            parent = Dir::open(child)?;
            rest = tail;
        }

        Some(parent)
    }

    /// 查名字，命中返回打开的 inode，由调用者关闭
    pub fn lookup(&self, name: &str) -> Option<Arc<Inode>> {
        let _dir_lock = self.inode.dir_lock().lock();
        self.lookup_entry(name)
            .and_then(|(entry, _)| Inode::open(self.inode.fs(), entry.inode_sector()))
    }

    /// 添加名为`name`、inode 在`inode_sector`的目录项。
    /// 复用最低的空槽，没有就追加。
    pub fn add(&self, name: &str, inode_sector: SectorId) -> Result<(), Error> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidName);
        }
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }

        let _dir_lock = self.inode.dir_lock().lock();
        if self.lookup_entry(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        // 最低空槽；读到文件尾就地追加。
        // inode 只在对象末尾短读，读满说明槽位完整。
        let mut entry = DirEntry::default();
        let mut offset = 0;
        while self.inode.read_at(offset, entry.as_bytes_mut()) == DirEntry::SIZE {
            if !entry.is_in_use() {
                break;
            }
            offset += DirEntry::SIZE;
        }

        let entry = DirEntry::new(name, inode_sector);
        if self.inode.write_at(offset, entry.as_bytes()) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// 删除名为`name`的目录项并标记其 inode 待删。
    ///
    /// 目标是目录时有两道闸：除本次打开外不得有别的句柄，且除
    /// `.`/`..`外必须为空。
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        if name == "." || name == ".." {
            return Err(Error::InvalidName);
        }

        let _dir_lock = self.inode.dir_lock().lock();
        let (mut entry, offset) = self.lookup_entry(name).ok_or(Error::NotFound)?;
        let inode = Inode::open(self.inode.fs(), entry.inode_sector()).ok_or(Error::NotFound)?;

        if inode.is_dir() {
            // 打开计数在父目录锁内核对，与逐出竞争无缘
            if inode.open_count() > 1 {
                return Err(Error::DirectoryInUse);
            }
            if !dir_inode_empty(&inode) {
                return Err(Error::DirectoryNotEmpty);
            }
        }

        entry.release();
        if self.inode.write_at(offset, entry.as_bytes()) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }
        inode.remove();
        Ok(())
    }

    /// 游标处往后第一个在用的名字，读完返回空
    pub fn readdir(&mut self) -> Option<String> {
        let _dir_lock = self.inode.dir_lock().lock();
        let mut entry = DirEntry::default();
        while self.inode.read_at(self.pos, entry.as_bytes_mut()) == DirEntry::SIZE {
            self.pos += DirEntry::SIZE;
            if entry.is_in_use() {
                return Some(String::from(entry.name()));
            }
        }
        None
    }

    /// 除`.`与`..`外是否空无一物
    pub fn is_empty(&self) -> bool {
        dir_inode_empty(&self.inode)
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// 线性扫描槽位数组。调用者须持目录锁
    fn lookup_entry(&self, name: &str) -> Option<(DirEntry, usize)> {
        let mut entry = DirEntry::default();
        let mut offset = 0;
        while self.inode.read_at(offset, entry.as_bytes_mut()) == DirEntry::SIZE {
            if entry.is_in_use() && entry.name() == name {
                return Some((entry, offset));
            }
            offset += DirEntry::SIZE;
        }
        None
    }
}

/// 在`inode`自己的锁内检查目录是否为空
fn dir_inode_empty(inode: &Arc<Inode>) -> bool {
    let _dir_lock = inode.dir_lock().lock();
    let mut entry = DirEntry::default();
    let mut offset = 0;
    while inode.read_at(offset, entry.as_bytes_mut()) == DirEntry::SIZE {
        if entry.is_in_use() && entry.name() != "." && entry.name() != ".." {
            return false;
        }
        offset += DirEntry::SIZE;
    }
    true
}
