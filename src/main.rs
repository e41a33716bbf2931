use std::{
    error::Error,
    fs::{read_dir, File as HostFile},
    io::{Read, Write},
    path::Path,
    process,
    sync::Arc,
};

use clap::{value_parser, Arg, Command};
use log::{error, info};

use tree_fs::{device::BlockFile, BlockDevice, Context, Vfs};

/// 默认镜像大小: 0x4000 个扇区, 即 8 MiB
const BLOCK_NUM: usize = 0x4000;

fn main() {
    init_logger();
    if let Err(err) = tree_fs_pack() {
        error!("packing failed: {}", err);
        process::exit(1);
    }
}

/// 日志格式: 时间戳 + 级别 + 内容; 级别由 RUST_LOG 控制, 默认 info
fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:<5}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn tree_fs_pack() -> Result<(), Box<dyn Error>> {
    let matches = Command::new("tree-fs packer")
        .about("Copy a host directory tree into a freshly formatted tree-fs image")
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .required(true)
                .help("Host directory to copy"),
        )
        .arg(
            Arg::new("image")
                .short('i')
                .long("image")
                .required(true)
                .help("Image file to create"),
        )
        .arg(
            Arg::new("blocks")
                .short('b')
                .long("blocks")
                .value_parser(value_parser!(usize))
                .default_value("16384")
                .help("Image size in 512-byte sectors"),
        )
        .get_matches();

    // required 参数一定存在
    let source = matches
        .get_one::<String>("source")
        .ok_or("missing --source")?;
    let image = matches.get_one::<String>("image").ok_or("missing --image")?;
    let blocks = matches
        .get_one::<usize>("blocks")
        .copied()
        .unwrap_or(BLOCK_NUM);
    info!("source: {}, image: {} ({} sectors)", source, image, blocks);

    // 在宿主机上创建镜像文件作为块设备, 并在其上格式化文件系统
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::create(image, blocks)?);
    let vfs = Vfs::init(block_file, true)?;
    let mut ctx = vfs.context();

    copy_tree(&vfs, &mut ctx, Path::new(source))?;

    // 列出镜像中的目录树
    let root = vfs.context();
    list_tree(&vfs, &root, "/", 0)?;
    vfs.done();
    Ok(())
}

/// 把宿主机目录 dir 下的内容复制到 ctx 的当前目录中
fn copy_tree(vfs: &Vfs, ctx: &mut Context, dir: &Path) -> Result<(), Box<dyn Error>> {
    for entry in read_dir(dir)? {
        let entry = entry?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| format!("non UTF-8 file name: {:?}", name))?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            vfs.mkdir(ctx, &name)?;
            vfs.chdir(ctx, &name)?;
            copy_tree(vfs, ctx, &path)?;
            vfs.chdir(ctx, "..")?;
        } else {
            let mut data = Vec::new();
            HostFile::open(&path)?.read_to_end(&mut data)?;
            vfs.create(ctx, &name, 0)?;
            let mut file = vfs.open(ctx, &name)?;
            let written = file.write(&data);
            if written != data.len() {
                return Err(format!(
                    "{}: only {} of {} bytes fit in the image",
                    path.display(),
                    written,
                    data.len()
                )
                .into());
            }
        }
    }
    Ok(())
}

fn list_tree(vfs: &Vfs, ctx: &Context, path: &str, depth: usize) -> Result<(), Box<dyn Error>> {
    let mut dir = vfs.open(ctx, path)?;
    while let Some(name) = vfs.readdir(&mut dir)? {
        let child = format!("{}{}", path, name);
        let file = vfs.open(ctx, &child)?;
        if vfs.is_dir(&file) {
            println!("{}{}/", "  ".repeat(depth), name);
            list_tree(vfs, ctx, &format!("{}/", child), depth + 1)?;
        } else {
            println!("{}{} ({} B)", "  ".repeat(depth), name, file.length());
        }
    }
    Ok(())
}
