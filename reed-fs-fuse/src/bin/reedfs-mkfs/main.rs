mod cli;

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use reed_fs::layout::InodeKind;
use reed_fs::{Inode, ReedFileSystem, BLOCK_SIZE};
use reed_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let block_file = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cli.image)?;
        fd.set_len(cli.sectors as u64 * BLOCK_SIZE as u64)?;
        fd
    })));

    let fs = ReedFileSystem::format(block_file, cli.sectors);
    let root = fs.root_dir();

    if let Some(source) = &cli.source {
        for dir_entry in fs::read_dir(source)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .expect("source file name is not valid UTF-8");

            let data = fs::read(&path)?;
            let sector = fs.alloc_sector().expect("volume is full");
            Inode::create(&fs, sector, InodeKind::File);
            root.add(name, sector)
                .unwrap_or_else(|err| panic!("packing {name:?}: {err:?}"));

            let inode = root.lookup(name).unwrap();
            assert_eq!(inode.write_at(0, &data), data.len(), "short write: {name}");
            println!("packed {name:?} ({} bytes)", data.len());
        }
    }

    fs.sync_all();

    if cli.list {
        let mut walker = root.reopen();
        while let Some(name) = walker.readdir() {
            println!("{name}");
        }
    }

    Ok(())
}
