use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use reed_fs::layout::InodeKind;
use reed_fs::{parse_filename, Dir, Error, Inode, ReedFileSystem, SectorId, BLOCK_SIZE, NAME_MAX};

use crate::{BlockFile, CountingDevice};

const IMG_SECTORS: u32 = 2048;

fn image_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("reedfs-{}-{}.img", name, std::process::id()))
}

fn block_file_sized(name: &str, sectors: u32) -> Arc<BlockFile> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image_path(name))
        .unwrap();
    file.set_len(sectors as u64 * BLOCK_SIZE as u64).unwrap();
    Arc::new(BlockFile(Mutex::new(file)))
}

fn block_file(name: &str) -> Arc<BlockFile> {
    block_file_sized(name, IMG_SECTORS)
}

fn fresh_fs(name: &str) -> Arc<ReedFileSystem> {
    ReedFileSystem::format(block_file(name), IMG_SECTORS)
}

/// 在`parent`下造一个子目录
fn mkdir(fs: &Arc<ReedFileSystem>, parent: &Dir, name: &str) -> SectorId {
    let sector = fs.alloc_sector().unwrap();
    Dir::create(fs, sector, parent.inode().sector()).unwrap();
    parent.add(name, sector).unwrap();
    sector
}

/// 在`parent`下造一个空文件
fn touch(fs: &Arc<ReedFileSystem>, parent: &Dir, name: &str) -> SectorId {
    let sector = fs.alloc_sector().unwrap();
    Inode::create(fs, sector, InodeKind::File);
    parent.add(name, sector).unwrap();
    sector
}

fn open_subdir(parent: &Dir, name: &str) -> Dir {
    Dir::open(parent.lookup(name).unwrap()).unwrap()
}

#[test]
fn fresh_volume_round_trip() {
    let fs = fresh_fs("round-trip");
    let root = fs.root_dir();

    let sector = touch(&fs, &root, "x");
    let found = root.lookup("x").unwrap();
    assert_eq!(found.sector(), sector);
    drop(found);

    root.remove("x").unwrap();
    assert!(root.lookup("x").is_none());
}

#[test]
fn smallest_volume_formats() {
    // 三个保留扇区 + 根目录的一个数据扇区
    let fs = ReedFileSystem::format(block_file_sized("four-sectors", 4), 4);
    let root = fs.root_dir();
    assert_eq!(root.lookup(".").unwrap().sector(), root.inode().sector());

    // 卷里已无空闲扇区
    assert!(fs.alloc_sector().is_none());
}

#[test]
#[should_panic(expected = "volume too small")]
fn undersized_volume_is_rejected() {
    // 只放得下保留扇区，根目录无处安身
    ReedFileSystem::format(block_file_sized("three-sectors", 3), 3);
}

#[test]
fn name_length_limits() {
    let fs = fresh_fs("name-limits");
    let root = fs.root_dir();
    let sector = fs.alloc_sector().unwrap();
    Inode::create(&fs, sector, InodeKind::File);

    let too_long = "A".repeat(NAME_MAX + 1);
    assert_eq!(root.add(&too_long, sector), Err(Error::NameTooLong));

    let longest = "A".repeat(NAME_MAX);
    root.add(&longest, sector).unwrap();
    assert!(root.lookup(&longest).is_some());

    assert_eq!(root.add("", sector), Err(Error::InvalidName));
    assert_eq!(root.add("a/b", sector), Err(Error::InvalidName));
}

#[test]
fn duplicate_names_rejected() {
    let fs = fresh_fs("duplicate");
    let root = fs.root_dir();

    let sector = touch(&fs, &root, "once");
    assert_eq!(root.add("once", sector), Err(Error::AlreadyExists));
}

#[test]
fn remove_refuses_non_empty_directory() {
    let fs = fresh_fs("non-empty");
    let root = fs.root_dir();

    mkdir(&fs, &root, "a");
    {
        let dir_a = open_subdir(&root, "a");
        mkdir(&fs, &dir_a, "b");
        assert!(!dir_a.is_empty());
    }

    assert_eq!(root.remove("a"), Err(Error::DirectoryNotEmpty));

    {
        let dir_a = open_subdir(&root, "a");
        dir_a.remove("b").unwrap();
        assert!(dir_a.is_empty());
    }
    root.remove("a").unwrap();
    assert!(root.lookup("a").is_none());
}

#[test]
fn remove_refuses_open_directory() {
    let fs = fresh_fs("dir-in-use");
    let root = fs.root_dir();

    mkdir(&fs, &root, "held");
    let held = open_subdir(&root, "held");
    assert_eq!(root.remove("held"), Err(Error::DirectoryInUse));

    drop(held);
    root.remove("held").unwrap();
}

#[test]
fn removing_dot_entries_is_invalid() {
    let fs = fresh_fs("dot-remove");
    let root = fs.root_dir();

    assert_eq!(root.remove("."), Err(Error::InvalidName));
    assert_eq!(root.remove(".."), Err(Error::InvalidName));
}

#[test]
fn dot_entries_resolve() {
    let fs = fresh_fs("dot-lookup");
    let root = fs.root_dir();

    let dot = root.lookup(".").unwrap();
    assert_eq!(dot.sector(), root.inode().sector());

    mkdir(&fs, &root, "a");
    let dir_a = open_subdir(&root, "a");
    let dotdot = dir_a.lookup("..").unwrap();
    assert_eq!(dotdot.sector(), root.inode().sector());
}

#[test]
fn open_rejects_file_inode() {
    let fs = fresh_fs("open-file");
    let root = fs.root_dir();

    let sector = touch(&fs, &root, "plain");
    let inode = root.lookup("plain").unwrap();
    assert_eq!(inode.sector(), sector);
    assert!(Dir::open(inode).is_none());
}

#[test]
fn relative_and_absolute_resolution() {
    let fs = fresh_fs("resolution");
    let root = fs.root_dir();

    // 两棵树：/u/a/b 和 /a/b
    mkdir(&fs, &root, "u");
    let dir_u = open_subdir(&root, "u");
    mkdir(&fs, &dir_u, "a");
    let dir_ua = open_subdir(&dir_u, "a");
    let ua_b = mkdir(&fs, &dir_ua, "b");

    mkdir(&fs, &root, "a");
    let dir_a = open_subdir(&root, "a");
    let a_b = mkdir(&fs, &dir_a, "b");

    // cwd = /u：相对路径从这里出发
    let parent = Dir::open_dirs(&fs, "a/b/c", &dir_u).unwrap();
    assert_eq!(parent.inode().sector(), ua_b);

    // 绝对路径无视 cwd
    let parent = Dir::open_dirs(&fs, "/a/b/c", &dir_u).unwrap();
    assert_eq!(parent.inode().sector(), a_b);
}

#[test]
fn resolution_canonicalises_repeated_slashes() {
    let fs = fresh_fs("canonical");
    let root = fs.root_dir();

    mkdir(&fs, &root, "a");
    let dir_a = open_subdir(&root, "a");
    let a_b = mkdir(&fs, &dir_a, "b");

    let plain = Dir::open_dirs(&fs, "/a/b/c", &root).unwrap();
    let doubled = Dir::open_dirs(&fs, "/a//b/c", &root).unwrap();
    assert_eq!(plain.inode().sector(), a_b);
    assert_eq!(doubled.inode().sector(), a_b);

    // 以`/`结尾的路径不指称文件
    assert!(Dir::open_dirs(&fs, "/a/b/", &root).is_none());
    assert!(Dir::open_dirs(&fs, "a/b/", &root).is_none());
}

#[test]
fn resolution_fails_on_missing_component() {
    let fs = fresh_fs("missing");
    let root = fs.root_dir();

    mkdir(&fs, &root, "a");
    assert!(Dir::open_dirs(&fs, "/a/nope/c", &root).is_none());

    let oversized = "A".repeat(NAME_MAX + 1);
    assert!(Dir::open_dirs(&fs, &format!("/{oversized}/c"), &root).is_none());
}

#[test]
fn resolution_through_dotdot() {
    let fs = fresh_fs("dotdot");
    let root = fs.root_dir();

    mkdir(&fs, &root, "a");
    let dir_a = open_subdir(&root, "a");

    // `..`是普通目录项，一样逐级查找
    let parent = Dir::open_dirs(&fs, "../f", &dir_a).unwrap();
    assert_eq!(parent.inode().sector(), root.inode().sector());
}

#[test]
fn open_dirs_agrees_with_final_lookup() {
    let fs = fresh_fs("final-lookup");
    let root = fs.root_dir();

    mkdir(&fs, &root, "u");
    let dir_u = open_subdir(&root, "u");
    let file = touch(&fs, &dir_u, "f");

    let filepath = "/u/f";
    let parent = Dir::open_dirs(&fs, filepath, &root).unwrap();
    let inode = parent.lookup(parse_filename(filepath)).unwrap();
    assert_eq!(inode.sector(), file);
}

#[test]
fn parse_filename_variants() {
    assert_eq!(parse_filename("/a/b/c"), "c");
    assert_eq!(parse_filename("c"), "c");
    assert_eq!(parse_filename("/c"), "c");
    assert_eq!(parse_filename("a/"), "");
}

#[test]
fn readdir_walks_live_entries() {
    let fs = fresh_fs("readdir");
    let root = fs.root_dir();

    touch(&fs, &root, "x");
    touch(&fs, &root, "y");

    // 游标生来越过`.`与`..`
    let mut walker = root.reopen();
    let mut names = Vec::new();
    while let Some(name) = walker.readdir() {
        names.push(name);
    }
    assert_eq!(names, ["x", "y"]);

    root.remove("x").unwrap();
    let mut walker = root.reopen();
    assert_eq!(walker.readdir().as_deref(), Some("y"));
    assert_eq!(walker.readdir(), None);
}

#[test]
fn freed_slot_is_reused_lowest_first() {
    let fs = fresh_fs("slot-reuse");
    let root = fs.root_dir();

    touch(&fs, &root, "x");
    touch(&fs, &root, "y");
    root.remove("x").unwrap();
    touch(&fs, &root, "z");

    // z 住进 x 腾出的最低空槽，于是排在 y 前面
    let mut walker = root.reopen();
    assert_eq!(walker.readdir().as_deref(), Some("z"));
    assert_eq!(walker.readdir().as_deref(), Some("y"));
}

#[test]
fn inode_write_read_across_blocks() {
    let fs = fresh_fs("inode-io");
    let root = fs.root_dir();

    let sector = touch(&fs, &root, "data");
    let inode = root.lookup("data").unwrap();
    assert_eq!(inode.sector(), sector);

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(inode.write_at(300, &payload), payload.len());
    assert_eq!(inode.size(), 300 + payload.len());

    let mut back = vec![0u8; payload.len()];
    assert_eq!(inode.read_at(300, &mut back), payload.len());
    assert_eq!(back, payload);

    // 头上的洞是补零的
    let mut head = [0xffu8; 300];
    assert_eq!(inode.read_at(0, &mut head), 300);
    assert!(head.iter().all(|&b| b == 0));

    // 读越过对象末尾即短读
    let mut tail = [0u8; 100];
    assert_eq!(inode.read_at(inode.size() - 10, &mut tail), 10);
}

#[test]
fn removed_inode_sector_is_recycled() {
    let fs = fresh_fs("recycle");
    let root = fs.root_dir();

    let sector = touch(&fs, &root, "doomed");
    {
        let inode = root.lookup("doomed").unwrap();
        inode.write_at(0, &[7u8; 1024]);
    }
    root.remove("doomed").unwrap();

    // 最后一个句柄已经关闭，inode 扇区被清零回收
    assert!(Inode::open(&fs, sector).is_none());
}

#[test]
fn write_through_cache_end_to_end() {
    let device = CountingDevice::new(block_file("counting"));
    let fs = ReedFileSystem::format(device.clone(), IMG_SECTORS);

    let target = fs.alloc_sector().unwrap();
    let data = [42u8; BLOCK_SIZE];
    fs.cache().write_at(target, &data, false, 0);

    let reads = device.reads();
    let mut back = [0u8; BLOCK_SIZE];
    fs.cache().read_at(target, &mut back, false, 0);
    assert_eq!(back, data);
    assert_eq!(device.reads(), reads, "read must be served from the cache");
}

#[test]
fn contents_survive_reload() {
    let fs = fresh_fs("reload");
    {
        let root = fs.root_dir();
        mkdir(&fs, &root, "etc");
        let etc = open_subdir(&root, "etc");
        touch(&fs, &etc, "motd");
        etc.lookup("motd").unwrap().write_at(0, b"hello, reed");
    }
    fs.sync_all();
    drop(fs);

    // 同一镜像重新装载
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image_path("reload"))
        .unwrap();
    let fs = ReedFileSystem::load(Arc::new(BlockFile(Mutex::new(file))));
    let root = fs.root_dir();
    let etc = open_subdir(&root, "etc");
    let motd = etc.lookup("motd").unwrap();

    let mut back = vec![0u8; motd.size()];
    motd.read_at(0, &mut back);
    assert_eq!(back, b"hello, reed");
}

#[test]
fn concurrent_adds_in_one_directory() {
    let fs = fresh_fs("concurrent-add");
    let root = Arc::new(fs.root_dir());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let fs = fs.clone();
            let root = root.clone();
            thread::spawn(move || {
                let sector = fs.alloc_sector().unwrap();
                Inode::create(&fs, sector, InodeKind::File);
                root.add(&format!("file{i}"), sector).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..8 {
        assert!(root.lookup(&format!("file{i}")).is_some());
    }
}

#[test]
fn concurrent_add_same_name_single_winner() {
    let fs = fresh_fs("single-winner");
    let root = Arc::new(fs.root_dir());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fs = fs.clone();
            let root = root.clone();
            thread::spawn(move || {
                let sector = fs.alloc_sector().unwrap();
                Inode::create(&fs, sector, InodeKind::File);
                root.add("contended", sector).is_ok()
            })
        })
        .collect();
    let outcomes: Vec<bool> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(outcomes.iter().filter(|&&won| won).count(), 1);
    assert!(root.lookup("contended").is_some());
}
