use std::ffi::OsString;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::storage::mmap::MmapStorage;

/// 索引文件 Header
const MAGIC: u32 = 0x5359_4458; // "SYDX"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
// magic + version + state + dir_len(u32) + blob_len(u64) + checksum(u64)
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8;

/// 目录段中一个键的 posting 位置（相对 blob 起点）。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WordEntry {
    pub word: String,
    pub off: u64,
    pub len: u32,
}

/// 一个 category 的键表，按 word 升序。
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryTable {
    pub name: String,
    pub words: Vec<WordEntry>,
}

/// 目录段：bincode 编码，常驻内存；posting 本体留在 mmap 的 blob 里惰性解码。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreDirectory {
    pub separator: char,
    /// 升序；文档号 = 下标
    pub documents: Vec<String>,
    /// 按 name 升序
    pub categories: Vec<CategoryTable>,
}

impl StoreDirectory {
    pub fn empty(separator: char) -> Self {
        Self {
            separator,
            documents: Vec::new(),
            categories: Vec::new(),
        }
    }
}

/// 校验通过的快照：目录已解码，blob 仍在映射里。
pub struct LoadedSnapshot {
    pub directory: StoreDirectory,
    pub mmap: Mmap,
    pub blob_start: usize,
    pub blob_len: usize,
    pub file_len: u64,
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn encode_header(state: u32, dir_len: u32, blob_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..16].copy_from_slice(&dir_len.to_le_bytes());
    header[16..24].copy_from_slice(&blob_len.to_le_bytes());
    header[24..32].copy_from_slice(&checksum.to_le_bytes());
    header
}

/// 原子写入快照（atomic replacement）
///
/// 1) 写 `<path>.tmp` 的 INCOMPLETE header（长度/校验先置 0）
/// 2) 顺序写目录段与 blob，边写边算 xxh3
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)：旧文件的 inode 对仍在映射它的读者保持有效
/// 6) fsync(dir)
///
/// 任一步失败都不影响 target；tmp 尽力删除。
pub fn write_atomic(path: &Path, directory: &StoreDirectory, blob: &[u8]) -> crate::Result<u64> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = tmp_path_for(path);
    let res = write_tmp_then_rename(path, &tmp_path, directory, blob);
    if res.is_err() && tmp_path.exists() {
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            tracing::warn!("Failed to remove temp index {:?}: {}", tmp_path, e);
        }
    }
    res
}

fn write_tmp_then_rename(
    path: &Path,
    tmp_path: &Path,
    directory: &StoreDirectory,
    blob: &[u8],
) -> crate::Result<u64> {
    let dir_bytes = bincode::serialize(directory)?;
    let dir_len: u32 = dir_bytes.len().try_into().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("index directory too large (>{} bytes)", u32::MAX),
        )
    })?;
    let blob_len = blob.len() as u64;

    let mut file = File::create(tmp_path)?;
    file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0, 0))?;

    let mut hasher = Xxh3::new();
    file.write_all(&dir_bytes)?;
    hasher.update(&dir_bytes);
    file.write_all(blob)?;
    hasher.update(blob);
    let checksum = hasher.digest();

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encode_header(STATE_COMMITTED, dir_len, blob_len, checksum))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    let total = HEADER_SIZE as u64 + dir_len as u64 + blob_len;
    tracing::debug!(
        "Index snapshot written: {:?} ({} docs, {} bytes)",
        path,
        directory.documents.len(),
        total
    );
    Ok(total)
}

/// 加载快照（校验 magic/version/state/长度/checksum/目录一致性）。
///
/// 文件缺失或任何格式问题都返回 `Ok(None)`（视为“不存在”）；只有真正的 I/O 失败才返回错误。
pub fn load_if_valid(path: &Path) -> std::io::Result<Option<LoadedSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }

    let (mmap, file_len) = MmapStorage::open_read(path)?;
    let data: &[u8] = &mmap;
    if data.len() < HEADER_SIZE {
        tracing::warn!("Index file {:?} too small, ignoring", path);
        return Ok(None);
    }

    let le_u32 = |r: std::ops::Range<usize>| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&data[r]);
        u32::from_le_bytes(b)
    };
    let le_u64 = |r: std::ops::Range<usize>| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&data[r]);
        u64::from_le_bytes(b)
    };

    let magic = le_u32(0..4);
    let version = le_u32(4..8);
    let state = le_u32(8..12);
    let dir_len = le_u32(12..16) as usize;
    let blob_len = le_u64(16..24);
    let stored_checksum = le_u64(24..32);

    if magic != MAGIC {
        tracing::warn!("Index magic mismatch: {:#x} != {:#x}", magic, MAGIC);
        return Ok(None);
    }
    if version != VERSION_CURRENT {
        tracing::warn!(
            "Index version mismatch: {} != {}",
            version,
            VERSION_CURRENT
        );
        return Ok(None);
    }
    if state != STATE_COMMITTED {
        tracing::warn!("Index state INCOMPLETE, ignoring");
        return Ok(None);
    }

    let body = &data[HEADER_SIZE..];
    let Ok(blob_len) = usize::try_from(blob_len) else {
        tracing::warn!("Index blob length overflows usize");
        return Ok(None);
    };
    if dir_len.checked_add(blob_len) != Some(body.len()) {
        tracing::warn!("Index data length mismatch");
        return Ok(None);
    }

    let computed = xxh3_64(body);
    if computed != stored_checksum {
        tracing::warn!(
            "Index checksum mismatch: {:#x} != {:#x}",
            computed,
            stored_checksum
        );
        return Ok(None);
    }

    let directory: StoreDirectory = match bincode::deserialize(&body[..dir_len]) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Index directory decode failed: {}", e);
            return Ok(None);
        }
    };

    if !directory_is_consistent(&directory, blob_len) {
        tracing::warn!("Index directory inconsistent with blob, ignoring");
        return Ok(None);
    }

    Ok(Some(LoadedSnapshot {
        directory,
        mmap,
        blob_start: HEADER_SIZE + dir_len,
        blob_len,
        file_len,
    }))
}

fn directory_is_consistent(directory: &StoreDirectory, blob_len: usize) -> bool {
    let sorted = |v: &[String]| v.windows(2).all(|w| w[0] < w[1]);
    if !sorted(&directory.documents) {
        return false;
    }
    if !directory.categories.windows(2).all(|w| w[0].name < w[1].name) {
        return false;
    }
    directory.categories.iter().all(|t| {
        t.words.windows(2).all(|w| w[0].word < w[1].word)
            && t.words.iter().all(|w| {
                w.off
                    .checked_add(w.len as u64)
                    .is_some_and(|end| end <= blob_len as u64)
            })
    })
}
