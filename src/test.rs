use super::device::{BlockFile, RamDisk};
use super::fs::{
    BlockDevice, Dir, FileSystem, FsError, Vfs, BLOCK_SIZE, DIRENTS_PER_BLOCK, FREE_MAP_SECTOR,
    NAME_LENGTH_LIMIT, ROOT_DIR_SECTOR,
};
use std::sync::Arc;

fn ram_vfs(blocks: usize) -> Vfs {
    Vfs::init(Arc::new(RamDisk::new(blocks)), true).unwrap()
}

fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

/// 从目录 dir 出发能到达的所有扇区
fn reachable(fs: &Arc<FileSystem>, dir: &Dir, out: &mut Vec<u32>) {
    out.extend(dir.inode().sectors());
    for (_, sector) in dir.entries() {
        let inode = fs.open_inode(sector);
        if inode.is_dir() {
            reachable(fs, &Dir::open(inode).unwrap(), out);
        } else {
            out.extend(inode.sectors());
        }
    }
}

fn assert_conservation(vfs: &Vfs) {
    let fs = vfs.file_system();
    let mut owned = fs.open_inode(FREE_MAP_SECTOR).sectors();
    reachable(fs, &Dir::open_root(fs), &mut owned);
    let count = owned.len();
    owned.sort_unstable();
    owned.dedup();
    assert_eq!(owned.len(), count, "a sector is owned twice");
    for &sector in owned.iter() {
        assert!(!fs.free_map.is_free(sector), "sector {} is owned but free", sector);
    }
    assert_eq!(vfs.free_sectors() + owned.len(), vfs.total_sectors());
}

#[test]
fn efs_test() {
    let vfs = ram_vfs(4096);
    let ctx = vfs.context();

    vfs.create(&ctx, "filea", 0).unwrap();
    vfs.create(&ctx, "fileb", 0).unwrap();
    let names: Vec<_> = Dir::open_root(vfs.file_system()).ls();
    assert_eq!(names, ["filea", "fileb"]);

    let mut filea = vfs.open(&ctx, "filea").unwrap();
    let greet_str = "Hello, world!";
    assert_eq!(filea.write(greet_str.as_bytes()), greet_str.len());
    let mut buffer = [0u8; 233];
    let len = filea.read_at(0, &mut buffer);
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap());

    // 跨越直接索引, 一级索引与二级索引的各种长度
    let random_str_test = |len: usize| {
        vfs.create(&ctx, "random", 0).unwrap();
        let mut file = vfs.open(&ctx, "random").unwrap();
        let data = random_bytes(len);
        assert_eq!(file.write(&data), len);
        assert_eq!(file.length(), len);

        let mut read_buffer = [0u8; 127];
        let mut read_back = Vec::new();
        file.seek(0);
        loop {
            let n = file.read(&mut read_buffer);
            if n == 0 {
                break;
            }
            read_back.extend_from_slice(&read_buffer[..n]);
        }
        assert!(read_back == data);
        drop(file);
        vfs.remove(&ctx, "random").unwrap();
    };

    let free = vfs.free_sectors();
    random_str_test(4 * BLOCK_SIZE);
    random_str_test(8 * BLOCK_SIZE + BLOCK_SIZE / 2);
    random_str_test(100 * BLOCK_SIZE);
    random_str_test(70 * BLOCK_SIZE + BLOCK_SIZE / 7);
    random_str_test((122 + 128) * BLOCK_SIZE);
    random_str_test(400 * BLOCK_SIZE);
    random_str_test(2000 * BLOCK_SIZE);
    assert_eq!(vfs.free_sectors(), free);
}

#[test]
fn create_then_open_round_trip() {
    let vfs = ram_vfs(1024);
    let ctx = vfs.context();
    vfs.create(&ctx, "/f", 3000).unwrap();

    let mut file = vfs.open(&ctx, "/f").unwrap();
    assert_eq!(file.length(), 3000);
    assert!(!vfs.is_dir(&file));
    let mut buf = vec![0xffu8; 3000];
    assert_eq!(file.read(&mut buf), 3000);
    assert!(buf.iter().all(|&b| b == 0));
    assert_eq!(file.read(&mut buf), 0);

    // 在范围内的任意位置写, 读回来的就是最后一次写入的内容
    let mut expect = vec![0u8; 3000];
    for _ in 0..20 {
        let offset = rand::random::<usize>() % 2900;
        let len = 1 + rand::random::<usize>() % (3000 - offset);
        let data = random_bytes(len);
        assert_eq!(file.write_at(offset, &data), len);
        expect[offset..offset + len].copy_from_slice(&data);
    }
    let mut back = vec![0u8; 3000];
    assert_eq!(file.read_at(0, &mut back), 3000);
    assert!(back == expect);

    // 写到末尾之后会自动扩容, 中间的空洞为 0
    assert_eq!(file.write_at(5000, b"tail"), 4);
    assert_eq!(file.length(), 5004);
    let mut hole = [1u8; 16];
    assert_eq!(file.read_at(4000, &mut hole), 16);
    assert_eq!(hole, [0u8; 16]);
    drop(file);
    assert_conservation(&vfs);
}

#[test]
fn non_empty_directory_cannot_be_removed() {
    let vfs = ram_vfs(512);
    let ctx = vfs.context();
    vfs.mkdir(&ctx, "d").unwrap();
    vfs.create(&ctx, "d/f", 0).unwrap();
    assert_eq!(vfs.remove(&ctx, "d"), Err(FsError::DirectoryNotEmpty));
    assert!(vfs.open(&ctx, "d/f").is_ok());

    vfs.remove(&ctx, "d/f").unwrap();
    vfs.remove(&ctx, "d").unwrap();
    assert_eq!(vfs.open(&ctx, "d").err(), Some(FsError::NotFound));
    assert_conservation(&vfs);
}

#[test]
fn dot_and_dot_dot_resolution() {
    let vfs = ram_vfs(512);
    let mut ctx = vfs.context();
    vfs.mkdir(&ctx, "a").unwrap();
    vfs.mkdir(&ctx, "a/b").unwrap();
    vfs.chdir(&mut ctx, "a/b").unwrap();

    let here = vfs.open(&ctx, ".").unwrap();
    let ab = vfs.open(&ctx, "/a/b").unwrap();
    assert_eq!(vfs.inumber(&here), vfs.inumber(&ab));
    assert_eq!(ctx.cwd(), vfs.inumber(&ab));

    let up = vfs.open(&ctx, "..").unwrap();
    let a = vfs.open(&ctx, "/a").unwrap();
    assert_eq!(vfs.inumber(&up), vfs.inumber(&a));

    // 根目录的父目录是它自己
    assert_eq!(vfs.open(&ctx, "/..").unwrap().inumber(), ROOT_DIR_SECTOR);
    assert_eq!(vfs.open(&ctx, "../../..").unwrap().inumber(), ROOT_DIR_SECTOR);
    assert_eq!(vfs.open(&ctx, "/").unwrap().inumber(), ROOT_DIR_SECTOR);
    assert_eq!(vfs.open(&ctx, "/a/./b/").unwrap().inumber(), vfs.inumber(&ab));

    vfs.create(&ctx, "../f", 0).unwrap();
    assert!(vfs.open(&ctx, "/a/f").is_ok());
}

#[test]
fn allocator_symmetry_on_a_live_volume() {
    let vfs = ram_vfs(300);
    let ctx = vfs.context();
    vfs.create(&ctx, "x", 2 * BLOCK_SIZE).unwrap();
    let free_map = &vfs.file_system().free_map;
    let before = free_map.snapshot();
    let sector = free_map.alloc_one().unwrap();
    free_map.release(sector, 1);
    assert_eq!(free_map.snapshot(), before);
}

#[test]
fn unlink_while_open_survives() {
    let vfs = ram_vfs(512);
    let ctx = vfs.context();
    let free = vfs.free_sectors();

    vfs.create(&ctx, "f", 0).unwrap();
    let mut file = vfs.open(&ctx, "f").unwrap();
    let data = random_bytes(3 * BLOCK_SIZE);
    assert_eq!(file.write(&data), data.len());

    vfs.remove(&ctx, "f").unwrap();
    assert_eq!(vfs.open(&ctx, "f").err(), Some(FsError::NotFound));

    // 句柄仍然可读可写, 扇区也还没有被回收
    assert_eq!(file.write(b"more"), 4);
    let mut back = vec![0u8; data.len()];
    assert_eq!(file.read_at(0, &mut back), data.len());
    assert!(back == data);
    assert!(vfs.free_sectors() < free);

    drop(file);
    assert_eq!(vfs.free_sectors(), free);
    vfs.create(&ctx, "f", 0).unwrap();
    assert_conservation(&vfs);
}

#[test]
fn concurrent_distinct_name_creation() {
    let vfs = ram_vfs(2048);
    let ctx = vfs.context();
    vfs.mkdir(&ctx, "/d").unwrap();

    std::thread::scope(|s| {
        for t in 0..2 {
            let vfs = &vfs;
            let mut ctx = ctx.clone();
            s.spawn(move || {
                vfs.chdir(&mut ctx, "/d").unwrap();
                for i in 0..20 {
                    vfs.create(&ctx, &format!("t{}_{}", t, i), 100).unwrap();
                }
            });
        }
    });

    let mut dir = vfs.open(&ctx, "/d").unwrap();
    let mut names = Vec::new();
    while let Some(name) = vfs.readdir(&mut dir).unwrap() {
        names.push(name);
    }
    assert_eq!(names.len(), 40);
    for t in 0..2 {
        for i in 0..20 {
            assert!(names.contains(&format!("t{}_{}", t, i)));
        }
    }
    drop(dir);
    assert_conservation(&vfs);
}

#[test]
fn concurrent_same_name_creation_admits_one() {
    let vfs = ram_vfs(512);
    let ctx = vfs.context();
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let vfs = &vfs;
                let ctx = ctx.clone();
                s.spawn(move || vfs.mkdir(&ctx, "same"))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .all(|r| r.is_ok() || *r == Err(FsError::AlreadyExists)));
    assert_conservation(&vfs);
}

#[test]
fn failed_create_rolls_back() {
    // 64 个扇区: 保留 2 个, Free-Map 与根目录的数据各 1 个, 余 60 个
    let vfs = ram_vfs(64);
    let ctx = vfs.context();
    assert_eq!(vfs.free_sectors(), 60);

    // inode 扇区能分到, 数据块不够
    let before = vfs.file_system().free_map.snapshot();
    assert_eq!(vfs.create(&ctx, "big", 60 * BLOCK_SIZE), Err(FsError::NoSpace));
    assert_eq!(vfs.file_system().free_map.snapshot(), before);
    assert_eq!(vfs.open(&ctx, "big").err(), Some(FsError::NotFound));

    // 填满根目录的第一个扇区, 只留下 2 个空闲扇区
    for i in 0..DIRENTS_PER_BLOCK - 1 {
        vfs.create(&ctx, &format!("f{}", i), 0).unwrap();
    }
    let fill = vfs.free_sectors() - 1 - 2;
    vfs.create(&ctx, "fill", fill * BLOCK_SIZE).unwrap();
    assert_eq!(vfs.free_sectors(), 2);

    // 新目录本身能建好, 但根目录扩容时空间不够: inode 与数据块都要归还
    let before = vfs.file_system().free_map.snapshot();
    let names = Dir::open_root(vfs.file_system()).ls();
    assert_eq!(vfs.mkdir(&ctx, "d"), Err(FsError::NoSpace));
    assert_eq!(vfs.file_system().free_map.snapshot(), before);
    assert_eq!(Dir::open_root(vfs.file_system()).ls(), names);
    assert_conservation(&vfs);
}

#[test]
fn short_write_keeps_length() {
    let vfs = ram_vfs(64);
    let ctx = vfs.context();
    vfs.create(&ctx, "f", BLOCK_SIZE).unwrap();
    let mut file = vfs.open(&ctx, "f").unwrap();
    let data = random_bytes(100 * BLOCK_SIZE);
    // 扩容失败: 只写入原长度之内的部分
    assert_eq!(file.write(&data), BLOCK_SIZE);
    assert_eq!(file.length(), BLOCK_SIZE);
    let mut back = vec![0u8; BLOCK_SIZE];
    assert_eq!(file.read_at(0, &mut back), BLOCK_SIZE);
    assert!(back[..] == data[..BLOCK_SIZE]);
    drop(file);
    assert_conservation(&vfs);
}

#[test]
fn readdir_skips_tombstones_and_reuses_slots() {
    let vfs = ram_vfs(256);
    let ctx = vfs.context();
    for name in ["a", "b", "c"] {
        vfs.create(&ctx, name, 0).unwrap();
    }
    vfs.remove(&ctx, "b").unwrap();

    let list = |vfs: &Vfs| {
        let mut dir = vfs.open(&ctx, "/").unwrap();
        let mut names = Vec::new();
        while let Some(name) = vfs.readdir(&mut dir).unwrap() {
            names.push(name);
        }
        names
    };
    assert_eq!(list(&vfs), ["a", "c"]);
    vfs.create(&ctx, "d", 0).unwrap();
    assert_eq!(list(&vfs), ["a", "d", "c"]);

    // 超过一个扇区的目录项时目录自动扩容
    for i in 0..DIRENTS_PER_BLOCK * 2 {
        vfs.create(&ctx, &format!("n{}", i), 0).unwrap();
    }
    assert_eq!(list(&vfs).len(), 3 + DIRENTS_PER_BLOCK * 2);
}

#[test]
fn path_errors() {
    let vfs = ram_vfs(256);
    let mut ctx = vfs.context();
    vfs.create(&ctx, "f", 0).unwrap();
    vfs.mkdir(&ctx, "d").unwrap();

    assert_eq!(vfs.open(&ctx, "").err(), Some(FsError::InvalidPath));
    assert_eq!(vfs.open(&ctx, "missing").err(), Some(FsError::NotFound));
    assert_eq!(vfs.open(&ctx, "f/x").err(), Some(FsError::NotADirectory));
    assert_eq!(vfs.open(&ctx, "nope/x").err(), Some(FsError::NotFound));
    assert_eq!(vfs.create(&ctx, "f", 0), Err(FsError::AlreadyExists));
    assert_eq!(vfs.mkdir(&ctx, "d"), Err(FsError::AlreadyExists));
    assert_eq!(vfs.mkdir(&ctx, "d/"), Err(FsError::AlreadyExists));
    assert_eq!(vfs.mkdir(&ctx, "."), Err(FsError::AlreadyExists));
    let long = "x".repeat(NAME_LENGTH_LIMIT + 1);
    assert_eq!(vfs.create(&ctx, &long, 0), Err(FsError::NameTooLong));
    assert_eq!(vfs.remove(&ctx, "/"), Err(FsError::InvalidPath));
    assert_eq!(vfs.remove(&ctx, "d/.."), Err(FsError::InvalidPath));
    assert_eq!(vfs.chdir(&mut ctx, "f"), Err(FsError::NotADirectory));
    assert_eq!(ctx.cwd(), ROOT_DIR_SECTOR);

    let mut file = vfs.open(&ctx, "f").unwrap();
    assert_eq!(vfs.readdir(&mut file), Err(FsError::NotADirectory));
    // 目录的内容不能直接写
    let mut dir = vfs.open(&ctx, "d").unwrap();
    assert!(vfs.is_dir(&dir));
    assert_eq!(dir.write(b"junk"), 0);
}

#[test]
fn removed_cwd_refuses_new_entries() {
    let vfs = ram_vfs(256);
    let mut ctx = vfs.context();
    vfs.mkdir(&ctx, "gone").unwrap();
    vfs.chdir(&mut ctx, "gone").unwrap();
    let free = {
        let root = vfs.context();
        vfs.remove(&root, "gone").unwrap();
        vfs.free_sectors()
    };
    assert_eq!(vfs.create(&ctx, "f", 0), Err(FsError::NotFound));
    assert_eq!(vfs.create(&ctx, "/f", 0), Err(FsError::NotFound));
    assert_eq!(vfs.free_sectors(), free);

    // 最后一个持有者离开后目录才被回收
    vfs.chdir(&mut ctx, "/").unwrap();
    assert!(vfs.free_sectors() > free);
    assert_conservation(&vfs);
}

#[test]
fn context_clone_reopens_cwd() {
    let vfs = ram_vfs(128);
    let ctx = vfs.context();
    let fs = vfs.file_system();
    let count = fs.open_count(ROOT_DIR_SECTOR);
    let forked = ctx.clone();
    assert_eq!(fs.open_count(ROOT_DIR_SECTOR), count + 1);
    drop(forked);
    assert_eq!(fs.open_count(ROOT_DIR_SECTOR), count);
}

#[test]
fn remount_sees_the_same_tree() {
    let disk: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(1024));
    let data = random_bytes(5 * BLOCK_SIZE + 17);
    let free = {
        let vfs = Vfs::init(Arc::clone(&disk), true).unwrap();
        let ctx = vfs.context();
        vfs.mkdir(&ctx, "etc").unwrap();
        vfs.create(&ctx, "etc/passwd", 0).unwrap();
        vfs.open(&ctx, "etc/passwd").unwrap().write(&data);
        let free = vfs.free_sectors();
        drop(ctx);
        vfs.done();
        free
    };

    let vfs = Vfs::init(disk, false).unwrap();
    assert_eq!(vfs.free_sectors(), free);
    let ctx = vfs.context();
    let file = vfs.open(&ctx, "/etc/passwd").unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(file.read_at(0, &mut back), data.len());
    assert!(back == data);
    drop(file);
    assert_conservation(&vfs);
}

#[test]
fn image_file_persists_across_devices() {
    let path = std::env::temp_dir().join(format!("tree-fs-{}.img", std::process::id()));
    let data = random_bytes(300 * BLOCK_SIZE);
    {
        let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::create(&path, 2048).unwrap());
        assert_eq!(block_file.num_blocks(), 2048);
        let vfs = Vfs::init(block_file, true).unwrap();
        let ctx = vfs.context();
        vfs.mkdir(&ctx, "bin").unwrap();
        vfs.create(&ctx, "/bin/app", 0).unwrap();
        assert_eq!(vfs.open(&ctx, "/bin/app").unwrap().write(&data), data.len());
        drop(ctx);
        vfs.done();
    }

    // 换一个设备对象, 只能从镜像文件里读到数据
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::open(&path).unwrap());
    let vfs = Vfs::init(block_file, false).unwrap();
    let ctx = vfs.context();
    let file = vfs.open(&ctx, "bin/app").unwrap();
    assert_eq!(file.length(), data.len());
    let mut back = vec![0u8; data.len()];
    assert_eq!(file.read_at(0, &mut back), data.len());
    assert!(back == data);
    drop(file);
    drop(ctx);
    drop(vfs);
    std::fs::remove_file(&path).ok();
}

#[test]
fn unformatted_device_is_rejected() {
    let disk: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(64));
    assert_eq!(Vfs::init(disk, false).err(), Some(FsError::InvalidImage));
}

#[test]
fn dot_dot_from_removed_cwd_is_not_found() {
    let vfs = ram_vfs(512);
    let root = vfs.context();
    let mut ctx = vfs.context();
    vfs.mkdir(&root, "a").unwrap();
    vfs.mkdir(&root, "a/b").unwrap();
    vfs.chdir(&mut ctx, "a/b").unwrap();
    let a = vfs.open(&root, "a").unwrap().inumber();

    vfs.remove(&root, "a/b").unwrap();
    vfs.remove(&root, "a").unwrap();
    // a 没有别人打开, 已经被回收
    assert!(vfs.file_system().free_map.is_free(a));

    assert_eq!(vfs.chdir(&mut ctx, ".."), Err(FsError::NotFound));
    assert_eq!(vfs.chdir(&mut ctx, "."), Err(FsError::NotFound));
    assert_eq!(vfs.open(&ctx, "../x").err(), Some(FsError::NotFound));
    assert_eq!(vfs.create(&ctx, "y", 0), Err(FsError::NotFound));
    assert!(vfs.file_system().free_map.is_free(a));

    vfs.chdir(&mut ctx, "/").unwrap();
    assert_conservation(&vfs);
}

#[test]
fn huge_offset_is_a_short_transfer() {
    let vfs = ram_vfs(128);
    let ctx = vfs.context();
    vfs.create(&ctx, "f", 100).unwrap();
    let mut file = vfs.open(&ctx, "f").unwrap();
    let free = vfs.free_sectors();

    file.seek(usize::MAX - 1);
    assert_eq!(file.read(&mut [0u8; 4]), 0);
    assert_eq!(file.write(&[1u8; 4]), 0);
    assert_eq!(file.tell(), usize::MAX - 1);
    assert_eq!(file.write_at(usize::MAX, b"x"), 0);
    assert_eq!(file.read_at(usize::MAX, &mut [0u8; 1]), 0);

    assert_eq!(file.length(), 100);
    assert_eq!(vfs.free_sectors(), free);
}

#[test]
fn is_empty_ignores_tombstones() {
    let vfs = ram_vfs(256);
    let ctx = vfs.context();
    vfs.mkdir(&ctx, "d").unwrap();
    let dir = Dir::open(vfs.open(&ctx, "d").unwrap().inode().reopen()).unwrap();
    assert!(dir.is_empty());

    vfs.create(&ctx, "d/f", 0).unwrap();
    vfs.create(&ctx, "d/g", 0).unwrap();
    assert!(!dir.is_empty());

    vfs.remove(&ctx, "d/f").unwrap();
    assert!(!dir.is_empty());
    vfs.remove(&ctx, "d/g").unwrap();
    // 只剩两个墓碑
    assert_eq!(dir.inode().length(), DIRENTS_PER_BLOCK * 32);
    assert!(dir.is_empty());
    assert_eq!(dir.ls(), Vec::<String>::new());

    drop(dir);
    vfs.remove(&ctx, "d").unwrap();
}
