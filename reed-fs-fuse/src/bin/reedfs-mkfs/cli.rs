use std::path::PathBuf;

use clap::Parser;

/// 格式化 reed-fs 镜像，可顺带把一批宿主文件装进根目录
#[derive(Parser)]
pub struct Cli {
    /// Image file to create
    pub image: PathBuf,

    /// Volume size in sectors
    #[arg(long, short, default_value_t = 2048)]
    pub sectors: u32,

    /// Host directory whose files are packed into the root directory
    #[arg(long, short = 'S')]
    pub source: Option<PathBuf>,

    /// List the root directory when done
    #[arg(long, short)]
    pub list: bool,
}
