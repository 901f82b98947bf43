use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

pub struct MmapStorage;

impl MmapStorage {
    /// 只读映射整个文件。调用方须保证文件之后只会被 rename 替换、不会被原地改写。
    pub fn open_read<P: AsRef<Path>>(path: P) -> std::io::Result<(Mmap, u64)> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mmap = unsafe { Mmap::map(&file)? };
        Ok((mmap, len))
    }
}
